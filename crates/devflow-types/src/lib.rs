//! Shared data model for the devflow orchestrator
//!
//! This crate defines the vocabulary every other devflow crate speaks:
//! workflows, phases, events, and the error classification used by the
//! retry policy. It deliberately contains no I/O; the state store owns
//! persistence and the engine owns mutation.

mod error;
mod event;
mod phase;
mod workflow;

pub use error::{Classified, ErrorClass};
pub use event::{Event, EventType, Severity};
pub use phase::{PhaseName, PhaseRecord, PhaseState};
pub use workflow::{
    IssueClass, ModelSet, Workflow, WorkflowFilter, WorkflowKind, WorkflowSpec, WorkflowState,
    BACKEND_PORT_RANGE, DEFAULT_BASE_BRANCH, FRONTEND_PORT_RANGE,
};

use uuid::Uuid;

/// Generate a new globally unique workflow id.
///
/// Ids are opaque strings; callers must not parse them. The `wf-` prefix
/// exists purely so ids are recognizable in logs and journals.
#[must_use]
pub fn new_workflow_id() -> String {
    format!("wf-{}", Uuid::new_v4().simple())
}

/// Generate a subscription id for the event bus.
#[must_use]
pub fn new_subscription_id() -> String {
    format!("sub-{}", Uuid::new_v4().simple())
}
