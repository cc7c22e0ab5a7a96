//! Immutable audit events.
//!
//! Events are append-only: the store assigns a monotonic `seq` and nothing
//! ever updates or deletes them, except `archive` which cascades them away
//! together with their workflow.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PhaseName;

/// The closed vocabulary of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    WorkflowStateChanged,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    WorkflowArchived,
    ResourceAllocated,
    ResourceReleased,
    ErrorOccurred,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow_created",
            Self::WorkflowStateChanged => "workflow_state_changed",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseFailed => "phase_failed",
            Self::WorkflowPaused => "workflow_paused",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::WorkflowArchived => "workflow_archived",
            Self::ResourceAllocated => "resource_allocated",
            Self::ResourceReleased => "resource_released",
            Self::ErrorOccurred => "error_occurred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "workflow_created" => Self::WorkflowCreated,
            "workflow_state_changed" => Self::WorkflowStateChanged,
            "phase_started" => Self::PhaseStarted,
            "phase_completed" => Self::PhaseCompleted,
            "phase_failed" => Self::PhaseFailed,
            "workflow_paused" => Self::WorkflowPaused,
            "workflow_resumed" => Self::WorkflowResumed,
            "workflow_cancelled" => Self::WorkflowCancelled,
            "workflow_archived" => Self::WorkflowArchived,
            "resource_allocated" => Self::ResourceAllocated,
            "resource_released" => Self::ResourceReleased,
            "error_occurred" => Self::ErrorOccurred,
            _ => return None,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity, used by subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry.
///
/// `seq` is 0 until the store has assigned one; published copies always
/// carry the assigned value because the engine persists before publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    pub workflow_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_name: Option<PhaseName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Minimal constructor; builder-style setters fill in the rest.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            seq: 0,
            workflow_id: workflow_id.into(),
            event_type,
            phase_name: None,
            from_state: None,
            to_state: None,
            severity: Severity::Info,
            message: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_phase(mut self, phase: PhaseName) -> Self {
        self.phase_name = Some(phase);
        self
    }

    #[must_use]
    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state = Some(from.into());
        self.to_state = Some(to.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serde_is_snake_case() {
        let json = serde_json::to_string(&EventType::WorkflowStateChanged).unwrap();
        assert_eq!(json, "\"workflow_state_changed\"");
        for t in [
            EventType::WorkflowCreated,
            EventType::PhaseStarted,
            EventType::ResourceAllocated,
            EventType::ErrorOccurred,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn severity_serde_is_uppercase() {
        assert_eq!(serde_json::to_string(&Severity::Warn).unwrap(), "\"WARN\"");
    }

    #[test]
    fn event_json_round_trip() {
        let evt = Event::new("wf-9", EventType::WorkflowStateChanged)
            .with_transition("created", "running")
            .with_message("started");
        let line = serde_json::to_string(&evt).unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.workflow_id, "wf-9");
        assert_eq!(back.event_type, EventType::WorkflowStateChanged);
        assert_eq!(back.from_state.as_deref(), Some("created"));
        assert_eq!(back.to_state.as_deref(), Some("running"));
    }
}
