//! LLM provider abstraction for devflow
//!
//! Every backend implements the [`ProviderClient`] trait, so the engine and
//! the consensus layer can talk to any provider without knowing transport
//! details. The [`ProviderRegistry`] maps stable provider names (`claude`,
//! `openai`, `gemini`) to clients and enforces per-provider concurrency
//! caps; the [`CostTracker`] accumulates spend and enforces budgets.
//!
//! Cancellation is cooperative: every `execute` call receives a
//! [`CancelToken`] and must return [`ProviderError::Cancelled`] promptly
//! once it fires.

mod anthropic;
mod cancel;
mod cost;
mod gemini;
mod http_client;
mod openai;
mod registry;
mod types;

pub use anthropic::AnthropicClient;
pub use cancel::{CancelSource, CancelToken};
pub use cost::{CostReport, CostTracker, ProviderTotals, RecordedUsage, WorkflowTotals};
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use registry::ProviderRegistry;
pub use types::{Message, ProviderClient, ProviderError, ProviderRequest, ProviderResponse, Role};
