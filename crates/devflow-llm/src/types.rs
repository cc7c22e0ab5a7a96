//! Core types for the provider abstraction.

use std::time::Duration;

use async_trait::async_trait;
use devflow_types::{Classified, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One request to a provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop: Option<Vec<String>>,
    /// Transport timeout for this call.
    pub timeout: Duration,
}

impl ProviderRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            stop: None,
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rough input-size estimate used for budget projection before the call
    /// is made. Four bytes per token is the usual planning figure.
    #[must_use]
    pub fn estimated_input_tokens(&self) -> u64 {
        let bytes: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (bytes / 4) as u64
    }
}

/// A successful provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    /// The raw response body, kept for auditability.
    pub raw: serde_json::Value,
}

/// Provider-layer failures.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("{provider}: authentication failed: {reason}")]
    Auth { provider: String, reason: String },

    #[error("{provider}: rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider}: timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider}: invalid request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("{provider}: provider unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("{provider}: cancelled")]
    Cancelled { provider: String },

    #[error("budget exceeded for workflow {workflow_id}: projected ${projected_usd:.4} over budget ${budget_usd:.4}")]
    BudgetExceeded {
        workflow_id: String,
        budget_usd: f64,
        projected_usd: f64,
    },

    #[error("{provider}: misconfigured: {reason}")]
    Misconfigured { provider: String, reason: String },

    #[error("unknown provider '{name}'")]
    UnknownProvider { name: String },
}

impl Classified for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable { .. } => {
                ErrorClass::Transient
            }
            Self::Auth { .. }
            | Self::InvalidRequest { .. }
            | Self::Cancelled { .. }
            | Self::BudgetExceeded { .. } => ErrorClass::Permanent,
            Self::Misconfigured { .. } => ErrorClass::Validation,
            Self::UnknownProvider { .. } => ErrorClass::NotFound,
        }
    }
}

/// The capability set every LLM backend exposes.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable identifier (`claude`, `openai`, `gemini`, …).
    fn name(&self) -> &str;

    /// Models this client can serve.
    fn models(&self) -> Vec<String>;

    /// Issue one request. Implementations must watch `cancel` and return
    /// [`ProviderError::Cancelled`] promptly when it fires.
    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancelToken,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Price a hypothetical call, in USD.
    fn cost_estimate(&self, tokens_in: u64, tokens_out: u64, model: &str) -> f64;
}

/// Price-per-million-token lookup shared by the HTTP backends.
pub(crate) fn price_from_table(
    table: &[(&str, f64, f64)],
    fallback: (f64, f64),
    tokens_in: u64,
    tokens_out: u64,
    model: &str,
) -> f64 {
    let (input_rate, output_rate) = table
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map_or(fallback, |(_, i, o)| (*i, *o));
    (tokens_in as f64 / 1_000_000.0) * input_rate + (tokens_out as f64 / 1_000_000.0) * output_rate
}
