//! Phase model: one execution attempt of a named step inside a workflow.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names of the steps a workflow plan may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Plan,
    Build,
    Test,
    Review,
    Deploy,
    GenerateTests,
    VerifyRed,
    VerifyGreen,
    Refactor,
}

impl PhaseName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Deploy => "deploy",
            Self::GenerateTests => "generate_tests",
            Self::VerifyRed => "verify_red",
            Self::VerifyGreen => "verify_green",
            Self::Refactor => "refactor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "plan" => Self::Plan,
            "build" => Self::Build,
            "test" => Self::Test,
            "review" => Self::Review,
            "deploy" => Self::Deploy,
            "generate_tests" => Self::GenerateTests,
            "verify_red" => Self::VerifyRed,
            "verify_green" => Self::VerifyGreen,
            "refactor" => Self::Refactor,
            _ => return None,
        })
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a single phase attempt.
///
/// Phases only move forward: `pending → running → {completed | failed | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use PhaseState::*;
        matches!(
            (self, to),
            (Pending, Running | Skipped) | (Running, Completed | Failed)
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted phase attempt. `(workflow_id, name, attempt)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub workflow_id: String,
    pub name: PhaseName,
    /// 1-based retry counter; each retry inserts a new row.
    pub attempt: u32,
    /// 0-based position in the workflow plan.
    pub index: u32,
    pub state: PhaseState,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,

    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub max_attempts: u32,

    pub llm_requests: u32,
    pub llm_tokens_in: u64,
    pub llm_tokens_out: u64,
    pub cost_usd: f64,
}

impl PhaseRecord {
    /// A fresh `pending` attempt.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        name: PhaseName,
        index: u32,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name,
            attempt,
            index,
            state: PhaseState::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            exit_code: None,
            error_message: None,
            max_attempts,
            llm_requests: 0,
            llm_tokens_in: 0,
            llm_tokens_out: 0,
            cost_usd: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_states_only_move_forward() {
        use PhaseState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Skipped.can_transition_to(Running));
    }

    #[test]
    fn phase_names_round_trip() {
        for name in [
            PhaseName::Plan,
            PhaseName::Build,
            PhaseName::Test,
            PhaseName::Review,
            PhaseName::Deploy,
            PhaseName::GenerateTests,
            PhaseName::VerifyRed,
            PhaseName::VerifyGreen,
            PhaseName::Refactor,
        ] {
            assert_eq!(PhaseName::parse(name.as_str()), Some(name));
        }
    }

    #[test]
    fn new_record_starts_pending_at_attempt() {
        let p = PhaseRecord::new("wf-1", PhaseName::Build, 1, 2, 3);
        assert_eq!(p.state, PhaseState::Pending);
        assert_eq!(p.attempt, 2);
        assert_eq!(p.max_attempts, 3);
        assert!(p.started_at.is_none());
    }
}
