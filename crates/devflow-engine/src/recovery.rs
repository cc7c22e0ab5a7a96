//! Crash recovery.
//!
//! On process start the engine scans for workflows left `running`: their
//! in-flight phases are marked `failed (interrupted)`, the workflow is
//! parked in `paused`, and a resume-required signal is raised so an
//! operator (or auto-resume policy) can re-drive them. Port bindings of
//! live workflows are re-marked in the allocator; bindings of finished
//! workflows are reclaimed.

use devflow_types::{
    Event, EventType, PhaseState, Severity, WorkflowFilter, WorkflowState,
};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::WorkflowEngine;
use crate::EngineError;

/// What a recovery pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub workflows_paused: usize,
    pub phases_interrupted: usize,
    pub ports_reclaimed: usize,
}

impl WorkflowEngine {
    /// Run the startup scan. Call once, before accepting new work.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        let orphaned = inner.store.list_workflows(&WorkflowFilter {
            states: vec![WorkflowState::Running],
            ..Default::default()
        })?;
        for workflow in &orphaned {
            for phase in inner.store.running_phases(&workflow.id)? {
                inner.store.finish_phase(
                    &workflow.id,
                    phase.name,
                    phase.attempt,
                    PhaseState::Failed,
                    Some(1),
                    Some("interrupted"),
                )?;
                inner.emit(
                    Event::new(&workflow.id, EventType::PhaseFailed)
                        .with_phase(phase.name)
                        .with_severity(Severity::Error)
                        .with_message("interrupted")
                        .with_metadata(json!({
                            "attempt": phase.attempt,
                            "index": phase.index,
                            "max_attempts": phase.max_attempts,
                        })),
                );
                report.phases_interrupted += 1;
            }
            inner.transition(
                &workflow.id,
                WorkflowState::Running,
                WorkflowState::Paused,
                None,
                None,
            )?;
            inner.emit(Event::new(&workflow.id, EventType::WorkflowPaused));
            inner.emit(
                Event::new(&workflow.id, EventType::ErrorOccurred)
                    .with_severity(Severity::Warn)
                    .with_message("resume_required"),
            );
            report.workflows_paused += 1;
            info!(workflow_id = %workflow.id, "recovered running workflow to paused");
        }

        // Reconcile port bindings against what actually survived.
        let all = inner.store.list_workflows(&WorkflowFilter::default())?;
        for workflow in &all {
            if workflow.backend_port.is_none() && workflow.frontend_port.is_none() {
                continue;
            }
            if workflow.state.is_terminal() || workflow.state == WorkflowState::Archived {
                inner
                    .ports
                    .release(workflow.backend_port, workflow.frontend_port);
                if let Err(e) = inner.store.clear_ports(&workflow.id) {
                    warn!(workflow_id = %workflow.id, error = %e, "failed to reclaim ports");
                    continue;
                }
                inner.emit(Event::new(&workflow.id, EventType::ResourceReleased));
                report.ports_reclaimed += 1;
            } else {
                inner
                    .ports
                    .mark_allocated(workflow.backend_port, workflow.frontend_port);
            }
        }

        Ok(report)
    }
}
