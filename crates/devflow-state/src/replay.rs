//! Journal replay.
//!
//! The NDJSON event journal carries enough metadata to rebuild the workflow
//! and phase tables from scratch: replaying from `seq = 0` reconstructs the
//! same rows modulo the monotonic timestamps. This is the disaster-recovery
//! path and the contract external subscribers rely on.

use devflow_types::{
    Event, EventType, ModelSet, PhaseName, PhaseRecord, PhaseState, Workflow, WorkflowKind,
    WorkflowSpec, WorkflowState,
};
use tracing::warn;

use crate::store::{StateError, StateStore};

/// Counters describing what a replay did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub workflows_created: usize,
    pub transitions_applied: usize,
    pub phases_replayed: usize,
    pub events_skipped: usize,
}

/// Re-apply a journal, in order, against an (empty) store.
pub fn replay_journal(store: &StateStore, events: &[Event]) -> Result<ReplayStats, StateError> {
    let mut stats = ReplayStats::default();
    for event in events {
        match event.event_type {
            EventType::WorkflowCreated => {
                let workflow = workflow_from_created(event)?;
                store.create_workflow(&workflow)?;
                stats.workflows_created += 1;
            }
            EventType::WorkflowStateChanged => {
                apply_state_change(store, event)?;
                stats.transitions_applied += 1;
            }
            EventType::PhaseStarted => {
                let (attempt, index, max_attempts) = phase_identity(event)?;
                let name = phase_name(event)?;
                let record =
                    PhaseRecord::new(&event.workflow_id, name, index, attempt, max_attempts);
                store.insert_phase(&record)?;
                store.start_phase(&event.workflow_id, name, attempt)?;
                store.increment_phase_count(&event.workflow_id)?;
                stats.phases_replayed += 1;
            }
            EventType::PhaseCompleted | EventType::PhaseFailed => {
                apply_phase_finish(store, event)?;
                stats.phases_replayed += 1;
            }
            EventType::WorkflowArchived => {
                store.archive_workflow(&event.workflow_id)?;
                stats.transitions_applied += 1;
            }
            EventType::ResourceAllocated | EventType::ResourceReleased => {
                apply_resource(store, event)?;
            }
            // Redundant with the workflow_state_changed records around them.
            EventType::WorkflowPaused
            | EventType::WorkflowResumed
            | EventType::WorkflowCancelled
            | EventType::ErrorOccurred => {
                stats.events_skipped += 1;
            }
        }
    }
    Ok(stats)
}

fn meta<'a>(event: &'a Event, key: &str) -> Option<&'a serde_json::Value> {
    event.metadata.as_ref().and_then(|m| m.get(key))
}

fn meta_str(event: &Event, key: &str) -> Option<String> {
    meta(event, key).and_then(|v| v.as_str()).map(str::to_string)
}

fn meta_u64(event: &Event, key: &str) -> Option<u64> {
    meta(event, key).and_then(serde_json::Value::as_u64)
}

fn corrupt(reason: impl Into<String>) -> StateError {
    StateError::Corrupt {
        reason: reason.into(),
    }
}

fn phase_name(event: &Event) -> Result<PhaseName, StateError> {
    event
        .phase_name
        .ok_or_else(|| corrupt(format!("phase event without phase_name (seq {})", event.seq)))
}

fn phase_identity(event: &Event) -> Result<(u32, u32, u32), StateError> {
    let attempt = meta_u64(event, "attempt")
        .ok_or_else(|| corrupt(format!("phase event without attempt (seq {})", event.seq)))?;
    let index = meta_u64(event, "index").unwrap_or(0);
    let max_attempts = meta_u64(event, "max_attempts").unwrap_or(3);
    Ok((attempt as u32, index as u32, max_attempts as u32))
}

fn workflow_from_created(event: &Event) -> Result<Workflow, StateError> {
    let name = meta_str(event, "name")
        .ok_or_else(|| corrupt("workflow_created event without name metadata"))?;
    let kind_raw = meta_str(event, "kind")
        .ok_or_else(|| corrupt("workflow_created event without kind metadata"))?;
    let kind = WorkflowKind::parse(&kind_raw)
        .ok_or_else(|| corrupt(format!("workflow_created with unknown kind '{kind_raw}'")))?;
    let task = meta_str(event, "task").unwrap_or_default();
    let model_set = meta_str(event, "model_set")
        .and_then(|raw| ModelSet::parse(&raw))
        .unwrap_or_default();
    let tags = meta(event, "tags")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let budget_usd = meta(event, "budget_usd").and_then(serde_json::Value::as_f64);

    Ok(Workflow::from_spec(
        event.workflow_id.clone(),
        WorkflowSpec {
            name,
            kind,
            task,
            tags,
            model_set,
            budget_usd,
            ..Default::default()
        },
        event.created_at,
    ))
}

fn apply_state_change(store: &StateStore, event: &Event) -> Result<(), StateError> {
    let from = event
        .from_state
        .as_deref()
        .and_then(WorkflowState::parse)
        .ok_or_else(|| corrupt(format!("state change without from_state (seq {})", event.seq)))?;
    let to = event
        .to_state
        .as_deref()
        .and_then(WorkflowState::parse)
        .ok_or_else(|| corrupt(format!("state change without to_state (seq {})", event.seq)))?;
    let exit_code = meta(event, "exit_code")
        .and_then(serde_json::Value::as_i64)
        .map(|code| code as i32);
    let error_message = meta_str(event, "error_message");
    store.transition_workflow(
        &event.workflow_id,
        from,
        to,
        exit_code,
        error_message.as_deref(),
    )?;
    Ok(())
}

fn apply_phase_finish(store: &StateStore, event: &Event) -> Result<(), StateError> {
    let name = phase_name(event)?;
    let (attempt, _, _) = phase_identity(event)?;
    let to = if event.event_type == EventType::PhaseCompleted {
        PhaseState::Completed
    } else {
        PhaseState::Failed
    };
    let exit_code = meta(event, "exit_code")
        .and_then(serde_json::Value::as_i64)
        .map(|code| code as i32);
    store.finish_phase(
        &event.workflow_id,
        name,
        attempt,
        to,
        exit_code,
        event.message.as_deref(),
    )?;

    let requests = meta_u64(event, "requests").unwrap_or(0) as u32;
    let tokens_in = meta_u64(event, "tokens_in").unwrap_or(0);
    let tokens_out = meta_u64(event, "tokens_out").unwrap_or(0);
    let cost_usd = meta(event, "cost_usd")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0);
    if requests > 0 || tokens_in > 0 || tokens_out > 0 || cost_usd > 0.0 {
        store.add_phase_usage(
            &event.workflow_id,
            name,
            attempt,
            requests,
            tokens_in,
            tokens_out,
            cost_usd,
        )?;
        store.add_workflow_usage(&event.workflow_id, cost_usd, tokens_in + tokens_out)?;
    }
    Ok(())
}

fn apply_resource(store: &StateStore, event: &Event) -> Result<(), StateError> {
    let resource = meta_str(event, "resource").unwrap_or_default();
    match event.event_type {
        EventType::ResourceAllocated => {
            let port = meta_u64(event, "port").map(|p| p as u16);
            match resource.as_str() {
                "backend_port" => store.set_ports(&event.workflow_id, port, None)?,
                "frontend_port" => store.set_ports(&event.workflow_id, None, port)?,
                other => warn!(resource = other, "unknown resource in journal; skipping"),
            }
        }
        EventType::ResourceReleased => store.clear_ports(&event.workflow_id)?,
        _ => unreachable!("caller matched the event type"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_types::Severity;
    use serde_json::json;

    fn created_event(id: &str) -> Event {
        Event::new(id, EventType::WorkflowCreated).with_metadata(json!({
            "name": "replayed",
            "kind": "standard",
            "task": "port the parser",
            "model_set": "fast",
            "tags": ["replay"],
        }))
    }

    #[test]
    fn replay_reconstructs_workflow_and_phase_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let id = "wf-replay";
        let events = vec![
            created_event(id),
            Event::new(id, EventType::WorkflowStateChanged).with_transition("created", "running"),
            Event::new(id, EventType::PhaseStarted)
                .with_phase(PhaseName::Plan)
                .with_metadata(json!({"attempt": 1, "index": 0, "max_attempts": 3})),
            Event::new(id, EventType::PhaseCompleted)
                .with_phase(PhaseName::Plan)
                .with_metadata(json!({
                    "attempt": 1, "index": 0, "max_attempts": 3,
                    "exit_code": 0, "requests": 1,
                    "tokens_in": 10, "tokens_out": 20, "cost_usd": 0.0003,
                })),
            Event::new(id, EventType::WorkflowStateChanged)
                .with_transition("running", "completed")
                .with_metadata(json!({"exit_code": 0})),
        ];

        let stats = replay_journal(&store, &events).unwrap();
        assert_eq!(stats.workflows_created, 1);
        assert_eq!(stats.transitions_applied, 2);
        assert_eq!(stats.phases_replayed, 2);

        let wf = store.get_workflow(id).unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);
        assert_eq!(wf.name, "replayed");
        assert_eq!(wf.model_set, ModelSet::Fast);
        assert_eq!(wf.total_tokens, 30);
        assert!((wf.cost_usd - 0.0003).abs() < 1e-9);
        assert_eq!(wf.phase_count, 1);

        let phases = store.list_phases(id).unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].state, PhaseState::Completed);
        assert_eq!(phases[0].llm_tokens_out, 20);
    }

    #[test]
    fn replay_preserves_failure_messages() {
        let store = StateStore::open_in_memory().unwrap();
        let id = "wf-fails";
        let events = vec![
            created_event(id),
            Event::new(id, EventType::WorkflowStateChanged).with_transition("created", "running"),
            Event::new(id, EventType::PhaseStarted)
                .with_phase(PhaseName::Plan)
                .with_metadata(json!({"attempt": 1, "index": 0, "max_attempts": 1})),
            Event::new(id, EventType::PhaseFailed)
                .with_phase(PhaseName::Plan)
                .with_severity(Severity::Error)
                .with_message("provider unavailable")
                .with_metadata(json!({"attempt": 1, "index": 0, "max_attempts": 1})),
            Event::new(id, EventType::WorkflowStateChanged)
                .with_transition("running", "failed")
                .with_metadata(json!({"exit_code": 1, "error_message": "provider unavailable"})),
        ];
        replay_journal(&store, &events).unwrap();

        let wf = store.get_workflow(id).unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);
        assert_eq!(wf.error_message.as_deref(), Some("provider unavailable"));
        let phase = store.get_phase(id, PhaseName::Plan, 1).unwrap();
        assert_eq!(phase.state, PhaseState::Failed);
        assert_eq!(phase.error_message.as_deref(), Some("provider unavailable"));
    }

    #[test]
    fn replay_rejects_created_event_without_identity() {
        let store = StateStore::open_in_memory().unwrap();
        let bare = Event::new("wf-x", EventType::WorkflowCreated);
        assert!(matches!(
            replay_journal(&store, &[bare]),
            Err(StateError::Corrupt { .. })
        ));
    }
}
