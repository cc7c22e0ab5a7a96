//! OpenAI Chat Completions backend (`openai`).

use async_trait::async_trait;
use devflow_config::ProviderConfig;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::http_client::{api_key_from_env, client, send_json};
use crate::types::{
    price_from_table, ProviderClient, ProviderError, ProviderRequest, ProviderResponse, Role,
};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// USD per million tokens, by model prefix.
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.6),
    ("gpt-4o", 2.5, 10.0),
    ("gpt-4.1", 2.0, 8.0),
    ("o3", 2.0, 8.0),
];
const FALLBACK_PRICE: (f64, f64) = (2.5, 10.0);

pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    default_model: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

impl OpenAiClient {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key: api_key_from_env(PROVIDER, &config.api_key_env)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model: config.default_model.clone(),
        })
    }

    fn wire_request<'a>(request: &'a ProviderRequest) -> WireRequest<'a> {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();
        WireRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop.as_deref(),
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = PRICES.iter().map(|(m, _, _)| (*m).to_string()).collect();
        if !models.contains(&self.default_model) {
            models.push(self.default_model.clone());
        }
        models
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let wire = Self::wire_request(&request);
        let builder = client()
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&wire);
        let (body, latency_ms) = send_json(PROVIDER, builder, request.timeout, &cancel).await?;

        let text = body
            .pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProviderError::Unavailable {
                provider: PROVIDER.to_string(),
                reason: "response carried no message content".to_string(),
            })?
            .to_string();
        let tokens_in = body
            .pointer("/usage/prompt_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let tokens_out = body
            .pointer("/usage/completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let model = body
            .pointer("/model")
            .and_then(|m| m.as_str())
            .unwrap_or(&request.model)
            .to_string();
        let cost_usd = self.cost_estimate(tokens_in, tokens_out, &model);

        Ok(ProviderResponse {
            provider: PROVIDER.to_string(),
            model,
            text,
            tokens_in,
            tokens_out,
            cost_usd,
            latency_ms,
            raw: body,
        })
    }

    fn cost_estimate(&self, tokens_in: u64, tokens_out: u64, model: &str) -> f64 {
        price_from_table(PRICES, FALLBACK_PRICE, tokens_in, tokens_out, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn mini_models_price_below_full_models() {
        let client = OpenAiClient {
            api_key: "k".into(),
            base_url: DEFAULT_BASE_URL.into(),
            default_model: "gpt-4o".into(),
        };
        let mini = client.cost_estimate(1_000_000, 1_000_000, "gpt-4o-mini");
        let full = client.cost_estimate(1_000_000, 1_000_000, "gpt-4o");
        assert!(mini < full);
    }

    #[test]
    fn roles_map_straight_through() {
        let request = ProviderRequest::new(
            "gpt-4o",
            vec![Message::system("s"), Message::user("u"), Message::assistant("a")],
        );
        let wire = OpenAiClient::wire_request(&request);
        let roles: Vec<_> = wire.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }
}
