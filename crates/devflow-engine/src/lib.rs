//! The devflow workflow engine
//!
//! Runs each workflow as a persistent state machine: phases execute in plan
//! order under one supervising task per workflow, every transition is a
//! compare-and-swap against the state store, and events are published only
//! after the corresponding row has committed.
//!
//! The engine owns mutation of workflow and phase rows; everything else
//! (bus, registry, router, consensus, cost tracker) is wired in at
//! construction. Tests inject mock providers through the registry.

mod collab;
mod engine;
mod health;
mod plan;
mod ports;
mod reaper;
mod recovery;

pub use collab::{IssueDetails, IssueSource, Workspace};
pub use engine::{EngineOptions, WorkflowEngine};
pub use health::{ComponentHealth, HealthReport};
pub use plan::{evaluate_verify, is_optional, phases_for};
pub use ports::PortAllocator;
pub use recovery::RecoveryReport;

use devflow_bus::BusError;
use devflow_consensus::ConsensusError;
use devflow_llm::ProviderError;
use devflow_router::RouterError;
use devflow_state::StateError;
use devflow_types::{Classified, ErrorClass, PhaseName};
use thiserror::Error;

/// Engine-level errors; component errors pass through with their class.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("invalid workflow spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("{pool} port pool exhausted")]
    ResourceExhausted { pool: &'static str },

    #[error("phase {phase} timed out after {timeout_seconds}s")]
    PhaseTimeout {
        phase: PhaseName,
        timeout_seconds: u64,
    },

    #[error("internal engine error: {reason}")]
    Internal { reason: String },
}

impl Classified for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::State(e) => e.class(),
            Self::Provider(e) => e.class(),
            Self::Consensus(e) => e.class(),
            Self::Router(e) => e.class(),
            Self::Bus(e) => e.class(),
            Self::InvalidSpec { .. } => ErrorClass::Validation,
            Self::ResourceExhausted { .. } => ErrorClass::Transient,
            Self::PhaseTimeout { .. } => ErrorClass::Transient,
            Self::Internal { .. } => ErrorClass::Internal,
        }
    }
}
