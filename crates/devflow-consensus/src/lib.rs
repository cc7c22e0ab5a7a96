//! Consensus: one logical request, answered by several providers
//!
//! The engine fans the same request out to every provider in a configured
//! group, in parallel, each under the group's per-call timeout. Successful
//! answers are merged deterministically (responses are ordered by provider
//! name before any strategy runs; ties resolve to the earlier provider in
//! the group's configured list). Fewer than `min_successful` answers is a
//! quorum failure, which is transient and retried like any other transient
//! phase error.

use std::collections::BTreeMap;
use std::time::Duration;

use devflow_config::{ConsensusConfig, ConsensusStrategy};
use devflow_llm::{
    CancelToken, Message, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse,
};
use devflow_types::{Classified, ErrorClass};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("consensus below quorum: {successful} of {required} required providers answered")]
    BelowQuorum { required: u32, successful: u32 },

    #[error("consensus cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Classified for ConsensusError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::BelowQuorum { .. } => ErrorClass::Transient,
            Self::Cancelled => ErrorClass::Permanent,
            Self::Provider(e) => e.class(),
        }
    }
}

/// Fully resolved synthesizer call (provider and model already defaulted).
#[derive(Debug, Clone)]
pub struct SynthesizerSpec {
    pub provider: String,
    pub model: String,
}

/// The merged result plus everything that went into it.
#[derive(Debug)]
pub struct ConsensusOutcome {
    /// The single response the phase consumes.
    pub response: ProviderResponse,
    /// Every successful participant, ordered by provider name.
    pub participants: Vec<ProviderResponse>,
    /// Usage summed over participants (and the synthesizer, if any).
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_usd: f64,
    pub requests: u32,
}

/// Fan-out/merge engine over a provider registry.
pub struct ConsensusEngine<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> ConsensusEngine<'a> {
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Run one consensus round.
    ///
    /// `requests` pairs each group provider with its fully resolved request
    /// (model defaults applied by the caller). `synthesizer` must be
    /// present for the synthesize strategy.
    pub async fn run(
        &self,
        group: &ConsensusConfig,
        requests: Vec<(String, ProviderRequest)>,
        synthesizer: Option<SynthesizerSpec>,
        cancel: CancelToken,
    ) -> Result<ConsensusOutcome, ConsensusError> {
        let call_timeout = Duration::from_secs(group.timeout_seconds);
        let calls = requests.into_iter().map(|(provider, request)| {
            let cancel = cancel.clone();
            async move {
                let result = tokio::time::timeout(
                    call_timeout,
                    self.registry.execute(&provider, request, cancel),
                )
                .await
                .unwrap_or(Err(ProviderError::Timeout {
                    provider: provider.clone(),
                    after: call_timeout,
                }));
                (provider, result)
            }
        });
        let results = join_all(calls).await;

        if cancel.is_cancelled() {
            return Err(ConsensusError::Cancelled);
        }

        let mut participants = Vec::new();
        for (provider, result) in results {
            match result {
                Ok(response) => participants.push(response),
                Err(error) => {
                    warn!(provider = %provider, error = %error, "consensus participant failed");
                }
            }
        }
        if participants.is_empty() || (participants.len() as u32) < group.min_successful {
            return Err(ConsensusError::BelowQuorum {
                required: group.min_successful.max(1),
                successful: participants.len() as u32,
            });
        }

        // Deterministic merge order regardless of completion order.
        participants.sort_by(|a, b| a.provider.cmp(&b.provider));

        let mut requests_made = participants.len() as u32;
        let mut total_tokens_in: u64 = participants.iter().map(|p| p.tokens_in).sum();
        let mut total_tokens_out: u64 = participants.iter().map(|p| p.tokens_out).sum();
        let mut total_cost_usd: f64 = participants.iter().map(|p| p.cost_usd).sum();

        let response = match group.strategy {
            ConsensusStrategy::MajorityVote => {
                majority_vote(&participants, &group.providers).clone()
            }
            ConsensusStrategy::BestOfN => best_of_n(&participants, &group.providers).clone(),
            ConsensusStrategy::Synthesize => {
                let spec = synthesizer.ok_or_else(|| {
                    ConsensusError::Provider(ProviderError::Misconfigured {
                        provider: "consensus".to_string(),
                        reason: "synthesize strategy without a synthesizer".to_string(),
                    })
                })?;
                let synthesis = self
                    .synthesize(&spec, &participants, call_timeout, cancel)
                    .await?;
                requests_made += 1;
                total_tokens_in += synthesis.tokens_in;
                total_tokens_out += synthesis.tokens_out;
                total_cost_usd += synthesis.cost_usd;
                synthesis
            }
        };

        debug!(
            strategy = ?group.strategy,
            participants = participants.len(),
            winner = %response.provider,
            "consensus merged"
        );

        Ok(ConsensusOutcome {
            response,
            participants,
            total_tokens_in,
            total_tokens_out,
            total_cost_usd,
            requests: requests_made,
        })
    }

    async fn synthesize(
        &self,
        spec: &SynthesizerSpec,
        participants: &[ProviderResponse],
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<ProviderResponse, ConsensusError> {
        let mut prompt = String::from(
            "Several assistants answered the same request. Combine their answers \
             into a single best answer. Answer only with the combined result.\n",
        );
        for (i, participant) in participants.iter().enumerate() {
            prompt.push_str(&format!(
                "\n--- Answer {} (from {}) ---\n{}\n",
                i + 1,
                participant.provider,
                participant.text
            ));
        }
        let request = ProviderRequest::new(spec.model.clone(), vec![Message::user(prompt)])
            .with_timeout(timeout);
        Ok(self
            .registry
            .execute(&spec.provider, request, cancel)
            .await?)
    }
}

/// Index of a provider within the group's configured order; unknown
/// providers sort last.
fn group_rank(group_order: &[String], provider: &str) -> usize {
    group_order
        .iter()
        .position(|p| p == provider)
        .unwrap_or(usize::MAX)
}

/// Modal answer wins; ties resolve to the answer whose earliest contributor
/// appears first in the group's provider list.
fn majority_vote<'p>(
    participants: &'p [ProviderResponse],
    group_order: &[String],
) -> &'p ProviderResponse {
    let mut buckets: BTreeMap<String, Vec<&ProviderResponse>> = BTreeMap::new();
    for participant in participants {
        buckets
            .entry(normalize_answer(&participant.text))
            .or_default()
            .push(participant);
    }
    buckets
        .values()
        .max_by(|a, b| {
            a.len().cmp(&b.len()).then_with(|| {
                // More is better; for equal counts the *lower* rank wins,
                // so compare reversed.
                bucket_rank(b, group_order).cmp(&bucket_rank(a, group_order))
            })
        })
        .and_then(|bucket| bucket.first())
        .copied()
        .expect("participants is non-empty: quorum was already checked")
}

fn bucket_rank(bucket: &[&ProviderResponse], group_order: &[String]) -> usize {
    bucket
        .iter()
        .map(|p| group_rank(group_order, &p.provider))
        .min()
        .unwrap_or(usize::MAX)
}

/// Discrete answers compare case- and whitespace-insensitively.
fn normalize_answer(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Length-normalised quality proxy: rewards substantive answers without
/// letting sheer volume win, then penalises heavy repetition.
fn score_response(response: &ProviderResponse) -> f64 {
    let words: Vec<&str> = response.text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: std::collections::BTreeSet<&str> = words.iter().copied().collect();
    let diversity = unique.len() as f64 / words.len() as f64;
    (words.len() as f64).ln_1p() * diversity
}

fn best_of_n<'p>(
    participants: &'p [ProviderResponse],
    group_order: &[String],
) -> &'p ProviderResponse {
    participants
        .iter()
        .max_by(|a, b| {
            score_response(a)
                .partial_cmp(&score_response(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    group_rank(group_order, &b.provider).cmp(&group_rank(group_order, &a.provider))
                })
        })
        .expect("participants is non-empty: quorum was already checked")
}
