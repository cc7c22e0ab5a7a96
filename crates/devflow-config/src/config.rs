use std::collections::BTreeMap;
use std::path::Path;

use camino::Utf8PathBuf;
use devflow_types::{Classified, ErrorClass, ModelSet, PhaseName, WorkflowKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
}

impl Classified for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub consensus: BTreeMap<String, ConsensusConfig>,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub budgets: BudgetsConfig,
}

/// One LLM provider entry (`providers.<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name of the environment variable holding the API key. The key itself
    /// never appears in configuration or logs.
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub default_model: String,
    pub concurrency_limit: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

/// Routing table: an ordered rule list plus a mandatory default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    pub default: Option<RoutingDecision>,
}

/// `when` predicate → `then` decision. First matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRule {
    pub when: RoutePredicate,
    pub then: RoutingDecision,
}

/// All present fields must match for a rule to fire; `tags` requires every
/// listed tag to be present on the workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutePredicate {
    pub phase: Option<PhaseName>,
    pub kind: Option<WorkflowKind>,
    pub model_set: Option<ModelSet>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What the router hands the engine for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingDecision {
    pub provider: String,
    /// Falls back to the provider's `default_model` when absent.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub use_consensus: bool,
    /// Name of a `consensus.<name>` group; required when `use_consensus`.
    pub consensus: Option<String>,
}

/// How answers from several providers are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusStrategy {
    MajorityVote,
    BestOfN,
    Synthesize,
}

/// A named consensus group (`consensus.<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsensusConfig {
    pub providers: Vec<String>,
    pub strategy: ConsensusStrategy,
    /// Required for the `synthesize` strategy.
    pub synthesizer: Option<SynthesizerConfig>,
    #[serde(default = "default_min_successful")]
    pub min_successful: u32,
    #[serde(default = "default_consensus_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesizerConfig {
    pub provider: String,
    pub model: Option<String>,
}

/// Durable-state layout, relative to the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: Utf8PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Event bus tuning and the optional on-disk journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// NDJSON journal path; `None` disables the persistence sink.
    pub journal_path: Option<Utf8PathBuf>,
    /// Worker pool for synchronous handlers. `0` runs them inline.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Handlers slower than this are flagged at WARN.
    #[serde(default = "default_slow_handler_ms")]
    pub slow_handler_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            max_workers: default_max_workers(),
            slow_handler_ms: default_slow_handler_ms(),
        }
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_call_timeout")]
    pub provider_call_timeout_seconds: u64,
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_seconds: u64,
    /// Wall-clock ceiling for a whole workflow; absent means unlimited.
    pub workflow_timeout_seconds: Option<u64>,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
    #[serde(default)]
    pub port_ranges: PortRanges,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_seconds: default_stuck_threshold(),
            default_max_attempts: default_max_attempts(),
            provider_call_timeout_seconds: default_call_timeout(),
            phase_timeout_seconds: default_phase_timeout(),
            workflow_timeout_seconds: None,
            reaper_interval_seconds: default_reaper_interval(),
            port_ranges: PortRanges::default(),
        }
    }
}

/// Inclusive port pools, `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRanges {
    #[serde(default = "default_backend_range")]
    pub backend: [u16; 2],
    #[serde(default = "default_frontend_range")]
    pub frontend: [u16; 2],
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            backend: default_backend_range(),
            frontend: default_frontend_range(),
        }
    }
}

/// Spend ceilings applied to new workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetsConfig {
    /// Applied when the workflow spec carries no budget of its own.
    pub default_usd: Option<f64>,
    /// Fraction of the budget at which a warning event is published.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            default_usd: None,
            warning_threshold: default_warning_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_min_successful() -> u32 {
    2
}
fn default_consensus_timeout() -> u64 {
    30
}
fn default_db_path() -> Utf8PathBuf {
    Utf8PathBuf::from("state/workflows.db")
}
fn default_max_workers() -> usize {
    10
}
fn default_slow_handler_ms() -> u64 {
    100
}
fn default_stuck_threshold() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_call_timeout() -> u64 {
    120
}
fn default_phase_timeout() -> u64 {
    600
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_backend_range() -> [u16; 2] {
    [9100, 9199]
}
fn default_frontend_range() -> [u16; 2] {
    [9200, 9299]
}
fn default_warning_threshold() -> f64 {
    0.8
}

impl Config {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// The default route, if configured.
    #[must_use]
    pub fn default_route(&self) -> Option<&RoutingDecision> {
        self.router.default.as_ref()
    }

    /// Cross-reference validation. Collects every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !self.providers.is_empty() && self.router.default.is_none() {
            errors.push("router.default is required".to_string());
        }

        let mut check_decision = |context: &str, decision: &RoutingDecision| {
            if !self.providers.contains_key(&decision.provider) {
                errors.push(format!(
                    "{context}: unknown provider '{}'",
                    decision.provider
                ));
            }
            match (&decision.use_consensus, &decision.consensus) {
                (true, None) => {
                    errors.push(format!("{context}: use_consensus without a consensus group"));
                }
                (true, Some(name)) if !self.consensus.contains_key(name) => {
                    errors.push(format!("{context}: unknown consensus group '{name}'"));
                }
                _ => {}
            }
        };

        if let Some(default) = &self.router.default {
            check_decision("router.default", default);
        }
        for (i, rule) in self.router.rules.iter().enumerate() {
            check_decision(&format!("router.rules[{i}]"), &rule.then);
        }

        for (name, group) in &self.consensus {
            if group.providers.len() < 2 {
                errors.push(format!(
                    "consensus.{name}: needs at least 2 providers, has {}",
                    group.providers.len()
                ));
            }
            for provider in &group.providers {
                if !self.providers.contains_key(provider) {
                    errors.push(format!("consensus.{name}: unknown provider '{provider}'"));
                }
            }
            if group.min_successful as usize > group.providers.len() {
                errors.push(format!(
                    "consensus.{name}: min_successful {} exceeds provider count {}",
                    group.min_successful,
                    group.providers.len()
                ));
            }
            match (group.strategy, &group.synthesizer) {
                (ConsensusStrategy::Synthesize, None) => {
                    errors.push(format!(
                        "consensus.{name}: synthesize strategy requires a synthesizer"
                    ));
                }
                (_, Some(synth)) if !self.providers.contains_key(&synth.provider) => {
                    errors.push(format!(
                        "consensus.{name}: unknown synthesizer provider '{}'",
                        synth.provider
                    ));
                }
                _ => {}
            }
        }

        for (label, [start, end]) in [
            ("backend", self.engine.port_ranges.backend),
            ("frontend", self.engine.port_ranges.frontend),
        ] {
            if start > end {
                errors.push(format!("engine.port_ranges.{label}: inverted range {start}-{end}"));
            }
        }

        if !(0.0..=1.0).contains(&self.budgets.warning_threshold) {
            errors.push(format!(
                "budgets.warning_threshold must be within [0, 1], got {}",
                self.budgets.warning_threshold
            ));
        }
        if let Some(budget) = self.budgets.default_usd {
            if budget < 0.0 {
                errors.push(format!("budgets.default_usd must be non-negative, got {budget}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { errors })
        }
    }
}
