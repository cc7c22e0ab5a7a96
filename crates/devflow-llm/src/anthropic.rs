//! Anthropic Messages API backend (`claude`).

use async_trait::async_trait;
use devflow_config::ProviderConfig;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::http_client::{api_key_from_env, client, send_json};
use crate::types::{
    price_from_table, Message, ProviderClient, ProviderError, ProviderRequest, ProviderResponse,
    Role,
};

const PROVIDER: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// USD per million tokens, by model prefix.
const PRICES: &[(&str, f64, f64)] = &[
    ("claude-opus", 15.0, 75.0),
    ("claude-sonnet", 3.0, 15.0),
    ("claude-haiku", 0.8, 4.0),
];
const FALLBACK_PRICE: (f64, f64) = (3.0, 15.0);

pub struct AnthropicClient {
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
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
}

impl AnthropicClient {
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

    fn wire_request<'a>(&self, request: &'a ProviderRequest) -> WireRequest<'a> {
        // Anthropic takes system text as a top-level field, not a message.
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();
        WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            temperature: request.temperature,
            stop_sequences: request.stop.as_deref(),
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
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
        let wire = self.wire_request(&request);
        let builder = client()
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire);
        let (body, latency_ms) = send_json(PROVIDER, builder, request.timeout, &cancel).await?;

        let text = body
            .pointer("/content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.pointer("/text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| ProviderError::Unavailable {
                provider: PROVIDER.to_string(),
                reason: "response carried no text content".to_string(),
            })?;
        let tokens_in = body
            .pointer("/usage/input_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let tokens_out = body
            .pointer("/usage/output_tokens")
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
