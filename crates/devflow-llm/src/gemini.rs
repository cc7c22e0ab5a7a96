//! Google Gemini backend (`gemini`), via the generateContent REST surface.

use async_trait::async_trait;
use devflow_config::ProviderConfig;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::http_client::{api_key_from_env, client, send_json};
use crate::types::{
    price_from_table, ProviderClient, ProviderError, ProviderRequest, ProviderResponse, Role,
};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// USD per million tokens, by model prefix.
const PRICES: &[(&str, f64, f64)] = &[
    ("gemini-2.0-flash", 0.1, 0.4),
    ("gemini-2.0-pro", 1.25, 10.0),
    ("gemini-1.5-pro", 1.25, 5.0),
];
const FALLBACK_PRICE: (f64, f64) = (1.25, 10.0);

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    default_model: String,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    generation_config: WireGenerationConfig<'a>,
}

impl GeminiClient {
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
        let system_parts: Vec<WirePart<'a>> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| WirePart { text: &m.content })
            .collect();
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireContent {
                role: match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                parts: vec![WirePart { text: &m.content }],
            })
            .collect();
        WireRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(WireContent {
                    role: "user",
                    parts: system_parts,
                })
            },
            generation_config: WireGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                stop_sequences: request.stop.as_deref(),
            },
        }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
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
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, request.model
        );
        let builder = client()
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&wire);
        let (body, latency_ms) = send_json(PROVIDER, builder, request.timeout, &cancel).await?;

        let text = body
            .pointer("/candidates/0/content/parts")
            .and_then(|parts| parts.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.pointer("/text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| ProviderError::Unavailable {
                provider: PROVIDER.to_string(),
                reason: "response carried no candidates".to_string(),
            })?;
        let tokens_in = body
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let tokens_out = body
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let cost_usd = self.cost_estimate(tokens_in, tokens_out, &request.model);

        Ok(ProviderResponse {
            provider: PROVIDER.to_string(),
            model: request.model,
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
