//! Background reaper for stuck workflows.
//!
//! A `running` workflow whose `last_activity_at` is older than the stuck
//! threshold is moved to `stuck` so operators notice it. The reaper never
//! kills tasks; `stuck` workflows can still be resumed, failed, or
//! cancelled explicitly.

use chrono::Utc;
use devflow_types::{Event, EventType, Severity, WorkflowFilter, WorkflowState};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::WorkflowEngine;

impl WorkflowEngine {
    /// Start the reaper loop. The returned handle aborts it on drop.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = engine.inner.options.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.reap_stuck_workflows();
            }
        })
    }

    /// One reaper sweep; public so tests (and operators) can force it.
    pub fn reap_stuck_workflows(&self) {
        let inner = &self.inner;
        let threshold = chrono::Duration::from_std(inner.options.stuck_threshold)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let running = match inner.store.list_workflows(&WorkflowFilter {
            states: vec![WorkflowState::Running],
            ..Default::default()
        }) {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "reaper could not list running workflows");
                return;
            }
        };
        let cutoff = Utc::now() - threshold;
        for workflow in running {
            if workflow.last_activity_at > cutoff {
                continue;
            }
            match inner.transition(
                &workflow.id,
                WorkflowState::Running,
                WorkflowState::Stuck,
                None,
                None,
            ) {
                Ok(_) => {
                    inner.emit(
                        Event::new(&workflow.id, EventType::ErrorOccurred)
                            .with_severity(Severity::Warn)
                            .with_message("workflow stuck: no activity past threshold"),
                    );
                    warn!(workflow_id = %workflow.id, "marked workflow stuck");
                }
                // Lost the race with real progress; that is the good case.
                Err(e) => {
                    tracing::debug!(workflow_id = %workflow.id, error = %e, "stuck sweep skipped workflow");
                }
            }
        }
    }
}
