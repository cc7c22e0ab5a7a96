//! devflow: agentic developer workflow orchestrator
//!
//! Accepts software-engineering tasks, drives them through multi-phase LLM
//! pipelines, and records every step in a durable SQLite store with a
//! replayable NDJSON event journal.
//!
//! The [`Orchestrator`] is the stable façade: it wires configuration, state,
//! the event bus, the provider registry, and the engine together, runs the
//! crash-recovery scan, and starts the stuck-workflow reaper. Outside this
//! crate, use the façade; the component crates are re-exported for embedders
//! who need finer control and for tests.

pub mod cli;
pub mod orchestrator;

pub use orchestrator::Orchestrator;

pub use devflow_bus::{read_journal, BusOptions, EventBus, EventFilter};
pub use devflow_config::Config;
pub use devflow_consensus::{ConsensusEngine, ConsensusError, ConsensusOutcome};
pub use devflow_engine::{
    ComponentHealth, EngineError, HealthReport, RecoveryReport, WorkflowEngine,
};
pub use devflow_llm::{
    CancelSource, CancelToken, CostReport, Message, ProviderClient, ProviderError,
    ProviderRegistry, ProviderRequest, ProviderResponse, Role,
};
pub use devflow_state::{replay_journal, MetricsAggregate, MetricsSnapshot, StateStore};
pub use devflow_types::{
    Event, EventType, PhaseName, PhaseRecord, PhaseState, Severity, Workflow, WorkflowFilter,
    WorkflowKind, WorkflowSpec, WorkflowState,
};
