//! Shared HTTP plumbing for the provider backends.
//!
//! One `reqwest::Client` per process; per-call timeouts come from the
//! request, and every call races the cancel token.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::types::ProviderError;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("default reqwest client construction cannot fail")
});

pub(crate) fn client() -> &'static Client {
    &CLIENT
}

/// Send a JSON request, racing the cancel token, and decode the body.
///
/// Returns the raw JSON on HTTP success; maps transport and status failures
/// onto the provider error taxonomy.
pub(crate) async fn send_json(
    provider: &str,
    builder: RequestBuilder,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(serde_json::Value, u64), ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled {
            provider: provider.to_string(),
        });
    }

    let started = Instant::now();
    let request = builder.timeout(timeout);

    let response = tokio::select! {
        () = cancel.cancelled() => {
            return Err(ProviderError::Cancelled { provider: provider.to_string() });
        }
        result = request.send() => result.map_err(|e| transport_error(provider, timeout, &e))?,
    };

    let status = response.status();
    let retry_after = parse_retry_after(&response);
    let body: serde_json::Value = tokio::select! {
        () = cancel.cancelled() => {
            return Err(ProviderError::Cancelled { provider: provider.to_string() });
        }
        result = response.json() => {
            result.map_err(|e| transport_error(provider, timeout, &e))?
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;
    debug!(provider, status = status.as_u16(), latency_ms, "provider call finished");

    if status.is_success() {
        Ok((body, latency_ms))
    } else {
        Err(status_error(provider, status, retry_after, &body))
    }
}

fn transport_error(provider: &str, timeout: Duration, error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            after: timeout,
        }
    } else {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            reason: error.to_string(),
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &serde_json::Value,
) -> ProviderError {
    let reason = body
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
        .to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth {
            provider: provider.to_string(),
            reason,
        },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::NOT_FOUND => {
            ProviderError::InvalidRequest {
                provider: provider.to_string(),
                reason,
            }
        }
        status if status.is_server_error() => ProviderError::Unavailable {
            provider: provider.to_string(),
            reason,
        },
        _ => ProviderError::Unavailable {
            provider: provider.to_string(),
            reason,
        },
    }
}

/// Read the API key named by the provider configuration.
pub(crate) fn api_key_from_env(provider: &str, env_var: &str) -> Result<String, ProviderError> {
    std::env::var(env_var).map_err(|_| ProviderError::Misconfigured {
        provider: provider.to_string(),
        reason: format!("environment variable {env_var} is not set"),
    })
}
