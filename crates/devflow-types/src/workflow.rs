//! Workflow model: the top-level unit of orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default base branch when the caller does not supply one.
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Port pool reserved for backend dev servers.
pub const BACKEND_PORT_RANGE: RangeInclusive<u16> = 9100..=9199;

/// Port pool reserved for frontend dev servers.
pub const FRONTEND_PORT_RANGE: RangeInclusive<u16> = 9200..=9299;

/// Lifecycle state of a workflow.
///
/// The legal transitions form a closed table (see [`WorkflowState::can_transition_to`]);
/// the engine rejects everything else with `InvalidTransition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Created,
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Stuck,
    Archived,
}

impl WorkflowState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stuck => "stuck",
            Self::Archived => "archived",
        }
    }

    /// Parse the canonical lowercase form stored in the database.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "initialized" => Self::Initialized,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "stuck" => Self::Stuck,
            "archived" => Self::Archived,
            _ => return None,
        })
    }

    /// Terminal states: the workflow has finished and may be archived.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The legal transition table.
    ///
    /// ```text
    /// created → initialized → running → { completed | failed | cancelled | paused | stuck }
    /// paused  → running | cancelled
    /// stuck   → running | failed | cancelled
    /// {completed|failed|cancelled} → archived
    /// ```
    ///
    /// `created → running` is also legal so `start` can skip the
    /// `initialized` step when there is no separate initialization work.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use WorkflowState::*;
        match (self, to) {
            (Created, Initialized | Running) => true,
            (Initialized, Running) => true,
            (Running, Completed | Failed | Cancelled | Paused | Stuck) => true,
            (Paused, Running | Cancelled) => true,
            (Stuck, Running | Failed | Cancelled) => true,
            (Completed | Failed | Cancelled, Archived) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shape of a workflow's phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    Standard,
    Tdd,
    PlanOnly,
    TestOnly,
    ReviewOnly,
}

impl WorkflowKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Tdd => "tdd",
            Self::PlanOnly => "plan-only",
            Self::TestOnly => "test-only",
            Self::ReviewOnly => "review-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "standard" => Self::Standard,
            "tdd" => Self::Tdd,
            "plan-only" => Self::PlanOnly,
            "test-only" => Self::TestOnly,
            "review-only" => Self::ReviewOnly,
            _ => return None,
        })
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the issue a workflow was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueClass {
    Feature,
    Bug,
    Test,
    Refactor,
    Docs,
    Chore,
}

impl IssueClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Test => "test",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "feature" => Self::Feature,
            "bug" => Self::Bug,
            "test" => Self::Test,
            "refactor" => Self::Refactor,
            "docs" => Self::Docs,
            "chore" => Self::Chore,
            _ => return None,
        })
    }
}

/// Which tier of models the router should prefer for this workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSet {
    #[default]
    Base,
    Fast,
    Powerful,
}

impl ModelSet {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Fast => "fast",
            Self::Powerful => "powerful",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "base" => Self::Base,
            "fast" => Self::Fast,
            "powerful" => Self::Powerful,
            _ => return None,
        })
    }
}

/// A persisted workflow row.
///
/// The state store is the single owner of these; other components hold
/// workflow ids, never references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    /// The task description the caller supplied; feeds phase prompts.
    pub task: String,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Set when the workflow reaches any terminal state, not only `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,

    pub issue_ref: Option<String>,
    pub branch: Option<String>,
    pub base_branch: String,
    pub worktree_path: Option<String>,

    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,

    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub retry_count: u32,

    pub cost_usd: f64,
    pub total_tokens: u64,
    pub phase_count: u32,

    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub issue_class: Option<IssueClass>,
    pub model_set: ModelSet,
    pub budget_usd: Option<f64>,
}

impl Workflow {
    /// Build a fresh `created` workflow from a caller-supplied spec.
    #[must_use]
    pub fn from_spec(id: String, spec: WorkflowSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            state: WorkflowState::Created,
            task: spec.task,
            created_at: now,
            started_at: None,
            last_activity_at: now,
            completed_at: None,
            archived_at: None,
            issue_ref: spec.issue_ref,
            branch: None,
            base_branch: spec
                .base_branch
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
            worktree_path: None,
            tags: spec.tags,
            metadata: spec.metadata,
            exit_code: None,
            error_message: None,
            retry_count: 0,
            cost_usd: 0.0,
            total_tokens: 0,
            phase_count: 0,
            backend_port: None,
            frontend_port: None,
            issue_class: spec.issue_class,
            model_set: spec.model_set,
            budget_usd: spec.budget_usd,
        }
    }
}

/// Caller-supplied description of a workflow to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub kind: WorkflowKind,
    pub task: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub model_set: ModelSet,
    pub budget_usd: Option<f64>,
    pub issue_ref: Option<String>,
    pub issue_class: Option<IssueClass>,
    pub base_branch: Option<String>,
}

impl Default for WorkflowKind {
    fn default() -> Self {
        Self::Standard
    }
}

/// Filter for `list` queries. Empty vectors mean "no constraint".
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub states: Vec<WorkflowState>,
    pub kinds: Vec<WorkflowKind>,
    pub issue_ref: Option<String>,
    pub tag: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use WorkflowState::*;
        assert!(Created.can_transition_to(Initialized));
        assert!(Created.can_transition_to(Running));
        assert!(Initialized.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(Running.can_transition_to(terminal));
            assert!(terminal.can_transition_to(Archived));
            assert!(terminal.is_terminal());
        }
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Stuck));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Stuck.can_transition_to(Running));
        assert!(Stuck.can_transition_to(Failed));

        // Rejected edges
        assert!(!Completed.can_transition_to(Running));
        assert!(!Archived.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Archived));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn state_round_trips_through_str() {
        for s in [
            WorkflowState::Created,
            WorkflowState::Initialized,
            WorkflowState::Running,
            WorkflowState::Paused,
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
            WorkflowState::Stuck,
            WorkflowState::Archived,
        ] {
            assert_eq!(WorkflowState::parse(s.as_str()), Some(s));
        }
        assert_eq!(WorkflowState::parse("bogus"), None);
    }

    #[test]
    fn kind_uses_kebab_case() {
        assert_eq!(WorkflowKind::PlanOnly.as_str(), "plan-only");
        assert_eq!(WorkflowKind::parse("test-only"), Some(WorkflowKind::TestOnly));
        let json = serde_json::to_string(&WorkflowKind::ReviewOnly).unwrap();
        assert_eq!(json, "\"review-only\"");
    }

    #[test]
    fn from_spec_defaults() {
        let now = Utc::now();
        let wf = Workflow::from_spec(
            "wf-1".into(),
            WorkflowSpec {
                name: "fix-login".into(),
                kind: WorkflowKind::Standard,
                task: "fix the login bug".into(),
                ..Default::default()
            },
            now,
        );
        assert_eq!(wf.state, WorkflowState::Created);
        assert_eq!(wf.base_branch, "main");
        assert_eq!(wf.model_set, ModelSet::Base);
        assert_eq!(wf.cost_usd, 0.0);
        assert!(wf.started_at.is_none());
    }
}
