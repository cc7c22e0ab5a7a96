//! Process-wide provider registry.
//!
//! Maps stable provider names to clients and enforces each provider's
//! concurrency cap with a semaphore. Constructed once at startup from
//! configuration; tests register their own mock clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use devflow_config::Config;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::anthropic::AnthropicClient;
use crate::cancel::CancelToken;
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;
use crate::types::{ProviderClient, ProviderError, ProviderRequest, ProviderResponse};

#[derive(Clone)]
struct Entry {
    client: Arc<dyn ProviderClient>,
    permits: Arc<Semaphore>,
}

/// `name → client` with per-provider concurrency limits.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration, constructing one HTTP backend
    /// per enabled provider entry. Disabled entries are skipped; unknown
    /// provider names are an error because routing rules may reference them.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let registry = Self::new();
        for (name, provider_config) in &config.providers {
            if !provider_config.enabled {
                info!(provider = %name, "provider disabled in configuration; skipping");
                continue;
            }
            let client: Arc<dyn ProviderClient> = match name.as_str() {
                "claude" => Arc::new(AnthropicClient::from_config(provider_config)?),
                "openai" => Arc::new(OpenAiClient::from_config(provider_config)?),
                "gemini" => Arc::new(GeminiClient::from_config(provider_config)?),
                other => {
                    return Err(ProviderError::UnknownProvider {
                        name: other.to_string(),
                    })
                }
            };
            registry.register(client, provider_config.concurrency_limit);
        }
        Ok(registry)
    }

    /// Register a client under its own name. Idempotent: registering the
    /// same name again replaces the entry (latest wins) with a warning.
    pub fn register(&self, client: Arc<dyn ProviderClient>, concurrency_limit: Option<usize>) {
        let name = client.name().to_string();
        let permits = Arc::new(Semaphore::new(
            concurrency_limit.unwrap_or(Semaphore::MAX_PERMITS),
        ));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .insert(name.clone(), Entry { client, permits })
            .is_some()
        {
            warn!(provider = %name, "provider re-registered; replacing previous client");
        }
    }

    /// O(1) lookup.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|entry| Arc::clone(&entry.client))
            .ok_or_else(|| ProviderError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Execute a request through the named provider, holding one of its
    /// concurrency permits for the duration of the call.
    pub async fn execute(
        &self,
        name: &str,
        request: ProviderRequest,
        cancel: CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::UnknownProvider {
                    name: name.to_string(),
                })?
        };
        let _permit = entry
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Unavailable {
                provider: name.to_string(),
                reason: "provider concurrency gate closed".to_string(),
            })?;
        entry.client.execute(request, cancel).await
    }

    /// Registered provider names, sorted for deterministic iteration.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}
