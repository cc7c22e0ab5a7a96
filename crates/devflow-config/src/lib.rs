//! Declarative configuration for the devflow orchestrator
//!
//! A single TOML document describes providers, routing rules, consensus
//! groups, the state/event layout, engine tuning, and budgets:
//!
//! ```toml
//! [providers.claude]
//! api_key_env = "ANTHROPIC_API_KEY"
//! default_model = "claude-sonnet-4"
//! concurrency_limit = 4
//!
//! [router]
//! default = { provider = "claude" }
//!
//! [[router.rules]]
//! when = { phase = "review", model_set = "powerful" }
//! then = { provider = "claude", use_consensus = true, consensus = "review-panel" }
//!
//! [consensus.review-panel]
//! providers = ["claude", "openai", "gemini"]
//! strategy = "majority-vote"
//! min_successful = 2
//! ```
//!
//! Loading never touches the network; validation collects every problem it
//! finds rather than stopping at the first.

mod config;

pub use config::{
    BudgetsConfig, Config, ConfigError, ConsensusConfig, ConsensusStrategy, EngineConfig,
    EventsConfig, PortRanges, ProviderConfig, RoutePredicate, RouteRule, RouterConfig,
    RoutingDecision, StateConfig, SynthesizerConfig,
};
