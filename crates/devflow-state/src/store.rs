use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devflow_types::{
    Classified, ErrorClass, Event, EventType, IssueClass, ModelSet, PhaseName, PhaseRecord,
    PhaseState, Severity, Workflow, WorkflowFilter, WorkflowKind, WorkflowState,
};
use rusqlite::{params, params_from_iter, Connection, Row};
use thiserror::Error;
use tracing::debug;

use crate::migrations;

/// State-store errors.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to open state database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("transition conflict on {id}: expected state {expected}, found {actual}")]
    TransitionConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid transition on {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("usage counters never decrease (workflow {id})")]
    UsageWouldDecrease { id: String },

    #[error("corrupt row: {reason}")]
    Corrupt { reason: String },
}

impl Classified for StateError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::TransitionConflict { .. } | Self::IllegalTransition { .. } => {
                ErrorClass::InvalidTransition
            }
            Self::UsageWouldDecrease { .. } => ErrorClass::Validation,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorClass::Transient
            }
            Self::Sqlite(_) | Self::Open { .. } | Self::Corrupt { .. } => ErrorClass::Internal,
        }
    }
}

const WORKFLOW_COLUMNS: &str = "id, name, kind, state, task, created_at, started_at, \
     last_activity_at, completed_at, archived_at, issue_ref, branch, base_branch, \
     worktree_path, tags, metadata, exit_code, error_message, retry_count, cost_usd, \
     total_tokens, phase_count, backend_port, frontend_port, issue_class, model_set, budget_usd";

const PHASE_COLUMNS: &str = "workflow_id, name, attempt, idx, state, started_at, completed_at, \
     duration_seconds, exit_code, error_message, max_attempts, llm_requests, llm_tokens_in, \
     llm_tokens_out, cost_usd";

const EVENT_COLUMNS: &str =
    "seq, workflow_id, event_type, phase_name, from_state, to_state, severity, message, \
     metadata, created_at";

/// The durable store. All writes serialize through the internal connection
/// mutex; methods are synchronous and never suspend while holding it.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if necessary) the database at `path` and bring the
    /// schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StateError::Corrupt {
                    reason: format!("cannot create state directory: {e}"),
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|source| StateError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::bootstrap(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn)
    }

    fn bootstrap(mut conn: Connection) -> Result<Self, StateError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL is a no-op for in-memory databases; the pragma still answers.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "opened state database");
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Highest applied migration version.
    pub fn schema_version(&self) -> Result<i64, StateError> {
        Ok(migrations::current_version(&self.lock())?)
    }

    /// Liveness probe for the health surface.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub fn create_workflow(&self, wf: &Workflow) -> Result<(), StateError> {
        let conn = self.lock();
        conn.execute(
            &format!("INSERT INTO workflows ({WORKFLOW_COLUMNS}) VALUES \
                (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,\
                 ?21,?22,?23,?24,?25,?26,?27)"),
            params![
                wf.id,
                wf.name,
                wf.kind.as_str(),
                wf.state.as_str(),
                wf.task,
                ts(wf.created_at),
                wf.started_at.map(ts),
                ts(wf.last_activity_at),
                wf.completed_at.map(ts),
                wf.archived_at.map(ts),
                wf.issue_ref,
                wf.branch,
                wf.base_branch,
                wf.worktree_path,
                serde_json::to_string(&wf.tags).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&wf.metadata).unwrap_or_else(|_| "{}".into()),
                wf.exit_code,
                wf.error_message,
                wf.retry_count,
                wf.cost_usd,
                wf.total_tokens as i64,
                wf.phase_count,
                wf.backend_port,
                wf.frontend_port,
                wf.issue_class.map(IssueClass::as_str),
                wf.model_set.as_str(),
                wf.budget_usd,
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Result<Workflow, StateError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
            [id],
            map_workflow,
        )
        .map_err(|e| not_found(e, "workflow", id))
    }

    pub fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, StateError> {
        let mut sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.states.is_empty() {
            sql.push_str(&in_clause("state", filter.states.len(), values.len()));
            for state in &filter.states {
                values.push(Box::new(state.as_str().to_string()));
            }
        }
        if !filter.kinds.is_empty() {
            sql.push_str(&in_clause("kind", filter.kinds.len(), values.len()));
            for kind in &filter.kinds {
                values.push(Box::new(kind.as_str().to_string()));
            }
        }
        if let Some(issue_ref) = &filter.issue_ref {
            values.push(Box::new(issue_ref.clone()));
            sql.push_str(&format!(" AND issue_ref = ?{}", values.len()));
        }
        if let Some(tag) = &filter.tag {
            // Tags are a JSON array of strings; match the quoted element.
            values.push(Box::new(format!("%\"{tag}\"%")));
            sql.push_str(&format!(" AND tags LIKE ?{}", values.len()));
        }
        if let Some(created_after) = &filter.created_after {
            values.push(Box::new(ts(*created_after)));
            sql.push_str(&format!(" AND created_at > ?{}", values.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(values.iter().map(|v| v.as_ref())),
            map_workflow,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Compare-and-swap state transition.
    ///
    /// Verifies legality against the transition table, then updates the row
    /// guarded by the expected current state. Timestamps derived from the
    /// target state (`started_at`, `completed_at`) are stamped in the same
    /// statement, so a transition is a single atomic write.
    pub fn transition_workflow(
        &self,
        id: &str,
        from: WorkflowState,
        to: WorkflowState,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<Workflow, StateError> {
        if !from.can_transition_to(to) {
            return Err(StateError::IllegalTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let now = ts(Utc::now());
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE workflows SET
                state = ?1,
                last_activity_at = ?2,
                started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                    THEN ?2 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ('completed','failed','cancelled')
                    AND completed_at IS NULL THEN ?2 ELSE completed_at END,
                exit_code = COALESCE(?3, exit_code),
                error_message = COALESCE(?4, error_message)
             WHERE id = ?5 AND state = ?6",
            params![to.as_str(), now, exit_code, error_message, id, from.as_str()],
        )?;
        if changed == 0 {
            let actual: Option<String> = conn
                .query_row("SELECT state FROM workflows WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .ok();
            return match actual {
                None => Err(StateError::NotFound {
                    entity: "workflow",
                    id: id.to_string(),
                }),
                Some(actual) => Err(StateError::TransitionConflict {
                    id: id.to_string(),
                    expected: from.to_string(),
                    actual,
                }),
            };
        }
        conn.query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
            [id],
            map_workflow,
        )
        .map_err(StateError::from)
    }

    pub fn touch_activity(&self, id: &str) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET last_activity_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    pub fn set_workspace(
        &self,
        id: &str,
        branch: Option<&str>,
        worktree_path: Option<&str>,
    ) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET branch = COALESCE(?1, branch),
                worktree_path = COALESCE(?2, worktree_path) WHERE id = ?3",
            params![branch, worktree_path, id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    /// Persist port bindings. `None` leaves a column untouched; use
    /// [`StateStore::clear_ports`] to release.
    pub fn set_ports(
        &self,
        id: &str,
        backend: Option<u16>,
        frontend: Option<u16>,
    ) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET backend_port = COALESCE(?1, backend_port),
                frontend_port = COALESCE(?2, frontend_port) WHERE id = ?3",
            params![backend, frontend, id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    pub fn clear_ports(&self, id: &str) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET backend_port = NULL, frontend_port = NULL WHERE id = ?1",
            [id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    /// Add cost/token usage to the workflow totals. Deltas must be
    /// non-negative; the totals are monotone by construction.
    pub fn add_workflow_usage(
        &self,
        id: &str,
        delta_cost_usd: f64,
        delta_tokens: u64,
    ) -> Result<(), StateError> {
        if delta_cost_usd < 0.0 {
            return Err(StateError::UsageWouldDecrease { id: id.to_string() });
        }
        let changed = self.lock().execute(
            "UPDATE workflows SET cost_usd = cost_usd + ?1,
                total_tokens = total_tokens + ?2, last_activity_at = ?3 WHERE id = ?4",
            params![delta_cost_usd, delta_tokens as i64, ts(Utc::now()), id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    pub fn increment_retry(&self, id: &str) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET retry_count = retry_count + 1 WHERE id = ?1",
            [id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    pub fn increment_phase_count(&self, id: &str) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE workflows SET phase_count = phase_count + 1 WHERE id = ?1",
            [id],
        )?;
        ensure_found(changed, "workflow", id)
    }

    /// Archive a terminal workflow: stamps `archived_at` and cascades the
    /// delete of its phases and events. Idempotent; archiving an archived
    /// workflow is a no-op.
    pub fn archive_workflow(&self, id: &str) -> Result<Workflow, StateError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row("SELECT state FROM workflows WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|e| not_found(e, "workflow", id))?;
        let current = WorkflowState::parse(&current).ok_or_else(|| StateError::Corrupt {
            reason: format!("workflow {id} has unknown state '{current}'"),
        })?;

        if current != WorkflowState::Archived {
            if !current.is_terminal() {
                return Err(StateError::IllegalTransition {
                    id: id.to_string(),
                    from: current.to_string(),
                    to: WorkflowState::Archived.to_string(),
                });
            }
            let now = ts(Utc::now());
            tx.execute(
                "UPDATE workflows SET state = 'archived', archived_at = ?1,
                    last_activity_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            tx.execute("DELETE FROM phases WHERE workflow_id = ?1", [id])?;
            tx.execute("DELETE FROM events WHERE workflow_id = ?1", [id])?;
        }
        let workflow = tx.query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
            [id],
            map_workflow,
        )?;
        tx.commit()?;
        Ok(workflow)
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    pub fn insert_phase(&self, phase: &PhaseRecord) -> Result<(), StateError> {
        self.lock().execute(
            &format!(
                "INSERT INTO phases ({PHASE_COLUMNS}) VALUES \
                 (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"
            ),
            params![
                phase.workflow_id,
                phase.name.as_str(),
                phase.attempt,
                phase.index,
                phase.state.as_str(),
                phase.started_at.map(ts),
                phase.completed_at.map(ts),
                phase.duration_seconds,
                phase.exit_code,
                phase.error_message,
                phase.max_attempts,
                phase.llm_requests,
                phase.llm_tokens_in as i64,
                phase.llm_tokens_out as i64,
                phase.cost_usd,
            ],
        )?;
        Ok(())
    }

    pub fn get_phase(
        &self,
        workflow_id: &str,
        name: PhaseName,
        attempt: u32,
    ) -> Result<PhaseRecord, StateError> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {PHASE_COLUMNS} FROM phases \
                     WHERE workflow_id = ?1 AND name = ?2 AND attempt = ?3"
                ),
                params![workflow_id, name.as_str(), attempt],
                map_phase,
            )
            .map_err(|e| not_found(e, "phase", &format!("{workflow_id}/{name}#{attempt}")))
    }

    /// All phase attempts of a workflow, in plan order then attempt order.
    pub fn list_phases(&self, workflow_id: &str) -> Result<Vec<PhaseRecord>, StateError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLUMNS} FROM phases WHERE workflow_id = ?1 \
             ORDER BY idx ASC, attempt ASC"
        ))?;
        let rows = stmt.query_map([workflow_id], map_phase)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn running_phases(&self, workflow_id: &str) -> Result<Vec<PhaseRecord>, StateError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLUMNS} FROM phases \
             WHERE workflow_id = ?1 AND state = 'running' ORDER BY idx ASC"
        ))?;
        let rows = stmt.query_map([workflow_id], map_phase)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// CAS `pending → running`, stamping `started_at`.
    pub fn start_phase(
        &self,
        workflow_id: &str,
        name: PhaseName,
        attempt: u32,
    ) -> Result<PhaseRecord, StateError> {
        let now = ts(Utc::now());
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE phases SET state = 'running', started_at = ?1 \
             WHERE workflow_id = ?2 AND name = ?3 AND attempt = ?4 AND state = 'pending'",
            params![now, workflow_id, name.as_str(), attempt],
        )?;
        if changed == 0 {
            return Err(StateError::TransitionConflict {
                id: format!("{workflow_id}/{name}#{attempt}"),
                expected: PhaseState::Pending.to_string(),
                actual: "unknown".to_string(),
            });
        }
        conn.query_row(
            &format!(
                "SELECT {PHASE_COLUMNS} FROM phases \
                 WHERE workflow_id = ?1 AND name = ?2 AND attempt = ?3"
            ),
            params![workflow_id, name.as_str(), attempt],
            map_phase,
        )
        .map_err(StateError::from)
    }

    /// Move a phase to a final state, stamping `completed_at` and
    /// `duration_seconds`. `completed`/`failed` require the phase to be
    /// `running`; `skipped` is only reachable from `pending`.
    pub fn finish_phase(
        &self,
        workflow_id: &str,
        name: PhaseName,
        attempt: u32,
        to: PhaseState,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<PhaseRecord, StateError> {
        let phase_id = format!("{workflow_id}/{name}#{attempt}");
        let allowed_from: &[PhaseState] = match to {
            PhaseState::Completed | PhaseState::Failed => &[PhaseState::Running],
            PhaseState::Skipped => &[PhaseState::Pending],
            PhaseState::Pending | PhaseState::Running => {
                return Err(StateError::IllegalTransition {
                    id: phase_id,
                    from: "final".to_string(),
                    to: to.to_string(),
                })
            }
        };
        let now = Utc::now();
        let conn = self.lock();
        let current: (String, Option<String>) = conn
            .query_row(
                "SELECT state, started_at FROM phases \
                 WHERE workflow_id = ?1 AND name = ?2 AND attempt = ?3",
                params![workflow_id, name.as_str(), attempt],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| not_found(e, "phase", &phase_id))?;
        let current_state = PhaseState::parse(&current.0).ok_or_else(|| StateError::Corrupt {
            reason: format!("phase {phase_id} has unknown state '{}'", current.0),
        })?;
        if !allowed_from.contains(&current_state) {
            return Err(StateError::IllegalTransition {
                id: phase_id,
                from: current_state.to_string(),
                to: to.to_string(),
            });
        }
        let duration = current
            .1
            .as_deref()
            .and_then(parse_ts)
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
        let changed = conn.execute(
            "UPDATE phases SET state = ?1, completed_at = ?2, duration_seconds = ?3,
                exit_code = ?4, error_message = ?5
             WHERE workflow_id = ?6 AND name = ?7 AND attempt = ?8 AND state = ?9",
            params![
                to.as_str(),
                ts(now),
                duration,
                exit_code,
                error_message,
                workflow_id,
                name.as_str(),
                attempt,
                current_state.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StateError::TransitionConflict {
                id: phase_id,
                expected: current_state.to_string(),
                actual: "changed concurrently".to_string(),
            });
        }
        conn.query_row(
            &format!(
                "SELECT {PHASE_COLUMNS} FROM phases \
                 WHERE workflow_id = ?1 AND name = ?2 AND attempt = ?3"
            ),
            params![workflow_id, name.as_str(), attempt],
            map_phase,
        )
        .map_err(StateError::from)
    }

    pub fn add_phase_usage(
        &self,
        workflow_id: &str,
        name: PhaseName,
        attempt: u32,
        requests: u32,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    ) -> Result<(), StateError> {
        if cost_usd < 0.0 {
            return Err(StateError::UsageWouldDecrease {
                id: workflow_id.to_string(),
            });
        }
        let changed = self.lock().execute(
            "UPDATE phases SET llm_requests = llm_requests + ?1,
                llm_tokens_in = llm_tokens_in + ?2,
                llm_tokens_out = llm_tokens_out + ?3,
                cost_usd = cost_usd + ?4
             WHERE workflow_id = ?5 AND name = ?6 AND attempt = ?7",
            params![
                requests,
                tokens_in as i64,
                tokens_out as i64,
                cost_usd,
                workflow_id,
                name.as_str(),
                attempt
            ],
        )?;
        ensure_found(changed, "phase", workflow_id)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event, assigning the store-wide monotonic `seq`.
    pub fn append_event(&self, event: &Event) -> Result<Event, StateError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (workflow_id, event_type, phase_name, from_state, to_state,
                severity, message, metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                event.workflow_id,
                event.event_type.as_str(),
                event.phase_name.map(PhaseName::as_str),
                event.from_state,
                event.to_state,
                event.severity.as_str(),
                event.message,
                event
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
                ts(event.created_at),
            ],
        )?;
        let mut stored = event.clone();
        stored.seq = conn.last_insert_rowid();
        Ok(stored)
    }

    /// Events for a workflow with `seq > since_seq`, in append order.
    pub fn events_since(
        &self,
        workflow_id: &str,
        since_seq: i64,
    ) -> Result<Vec<Event>, StateError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE workflow_id = ?1 AND seq > ?2 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![workflow_id, since_seq], map_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn ensure_found(changed: usize, entity: &'static str, id: &str) -> Result<(), StateError> {
    if changed == 0 {
        Err(StateError::NotFound {
            entity,
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}

fn not_found(e: rusqlite::Error, entity: &'static str, id: &str) -> StateError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StateError::NotFound {
            entity,
            id: id.to_string(),
        },
        other => StateError::Sqlite(other),
    }
}

fn in_clause(column: &str, count: usize, offset: usize) -> String {
    let placeholders: Vec<String> = (1..=count).map(|i| format!("?{}", offset + i)).collect();
    format!(" AND {column} IN ({})", placeholders.join(","))
}

fn bad_column(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {column}: {value}").into(),
    )
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| bad_column("timestamp", &raw))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .ok_or_else(|| bad_column("timestamp", &raw)),
    }
}

fn map_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    let kind: String = row.get(2)?;
    let state: String = row.get(3)?;
    let tags_raw: String = row.get(14)?;
    let metadata_raw: String = row.get(15)?;
    let issue_class: Option<String> = row.get(24)?;
    let model_set: String = row.get(25)?;

    let tags: BTreeSet<String> =
        serde_json::from_str(&tags_raw).map_err(|_| bad_column("tags", &tags_raw))?;
    let metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_raw).map_err(|_| bad_column("metadata", &metadata_raw))?;

    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: WorkflowKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        state: WorkflowState::parse(&state).ok_or_else(|| bad_column("state", &state))?,
        task: row.get(4)?,
        created_at: get_ts(row, 5)?,
        started_at: get_opt_ts(row, 6)?,
        last_activity_at: get_ts(row, 7)?,
        completed_at: get_opt_ts(row, 8)?,
        archived_at: get_opt_ts(row, 9)?,
        issue_ref: row.get(10)?,
        branch: row.get(11)?,
        base_branch: row.get(12)?,
        worktree_path: row.get(13)?,
        tags,
        metadata,
        exit_code: row.get(16)?,
        error_message: row.get(17)?,
        retry_count: row.get(18)?,
        cost_usd: row.get(19)?,
        total_tokens: row.get::<_, i64>(20)? as u64,
        phase_count: row.get(21)?,
        backend_port: row.get(22)?,
        frontend_port: row.get(23)?,
        issue_class: issue_class
            .map(|raw| IssueClass::parse(&raw).ok_or_else(|| bad_column("issue_class", &raw)))
            .transpose()?,
        model_set: ModelSet::parse(&model_set).ok_or_else(|| bad_column("model_set", &model_set))?,
        budget_usd: row.get(26)?,
    })
}

fn map_phase(row: &Row<'_>) -> rusqlite::Result<PhaseRecord> {
    let name: String = row.get(1)?;
    let state: String = row.get(4)?;
    Ok(PhaseRecord {
        workflow_id: row.get(0)?,
        name: PhaseName::parse(&name).ok_or_else(|| bad_column("name", &name))?,
        attempt: row.get(2)?,
        index: row.get(3)?,
        state: PhaseState::parse(&state).ok_or_else(|| bad_column("state", &state))?,
        started_at: get_opt_ts(row, 5)?,
        completed_at: get_opt_ts(row, 6)?,
        duration_seconds: row.get(7)?,
        exit_code: row.get(8)?,
        error_message: row.get(9)?,
        max_attempts: row.get(10)?,
        llm_requests: row.get(11)?,
        llm_tokens_in: row.get::<_, i64>(12)? as u64,
        llm_tokens_out: row.get::<_, i64>(13)? as u64,
        cost_usd: row.get(14)?,
    })
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(2)?;
    let phase_name: Option<String> = row.get(3)?;
    let severity: String = row.get(6)?;
    let metadata_raw: Option<String> = row.get(8)?;
    Ok(Event {
        seq: row.get(0)?,
        workflow_id: row.get(1)?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| bad_column("event_type", &event_type))?,
        phase_name: phase_name
            .map(|raw| PhaseName::parse(&raw).ok_or_else(|| bad_column("phase_name", &raw)))
            .transpose()?,
        from_state: row.get(4)?,
        to_state: row.get(5)?,
        severity: match severity.as_str() {
            "INFO" => Severity::Info,
            "WARN" => Severity::Warn,
            "ERROR" => Severity::Error,
            other => return Err(bad_column("severity", other)),
        },
        message: row.get(7)?,
        metadata: metadata_raw
            .map(|raw| serde_json::from_str(&raw).map_err(|_| bad_column("metadata", &raw)))
            .transpose()?,
        created_at: get_ts(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_types::{new_workflow_id, WorkflowSpec};

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn make_workflow(store: &StateStore, kind: WorkflowKind) -> Workflow {
        let wf = Workflow::from_spec(
            new_workflow_id(),
            WorkflowSpec {
                name: "demo".into(),
                kind,
                task: "do the thing".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        store.create_workflow(&wf).unwrap();
        wf
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = store();
        let mut wf = make_workflow(&store, WorkflowKind::Standard);
        wf.tags.insert("alpha".into());

        let loaded = store.get_workflow(&wf.id).unwrap();
        assert_eq!(loaded.id, wf.id);
        assert_eq!(loaded.kind, WorkflowKind::Standard);
        assert_eq!(loaded.state, WorkflowState::Created);
        assert_eq!(loaded.task, "do the thing");
        assert_eq!(loaded.base_branch, "main");
    }

    #[test]
    fn get_missing_workflow_is_not_found() {
        let store = store();
        match store.get_workflow("wf-missing") {
            Err(StateError::NotFound { entity, .. }) => assert_eq!(entity, "workflow"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn cas_transition_stamps_timestamps() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);

        let running = store
            .transition_workflow(&wf.id, WorkflowState::Created, WorkflowState::Running, None, None)
            .unwrap();
        assert_eq!(running.state, WorkflowState::Running);
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = store
            .transition_workflow(
                &wf.id,
                WorkflowState::Running,
                WorkflowState::Completed,
                Some(0),
                None,
            )
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.exit_code, Some(0));
        // started_at survives later transitions
        assert_eq!(done.started_at, running.started_at);
    }

    #[test]
    fn cas_transition_rejects_wrong_expected_state() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        match store.transition_workflow(
            &wf.id,
            WorkflowState::Running,
            WorkflowState::Completed,
            None,
            None,
        ) {
            Err(StateError::TransitionConflict { expected, actual, .. }) => {
                assert_eq!(expected, "running");
                assert_eq!(actual, "created");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn illegal_transition_is_rejected_before_touching_the_row() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        match store.transition_workflow(
            &wf.id,
            WorkflowState::Created,
            WorkflowState::Archived,
            None,
            None,
        ) {
            Err(StateError::IllegalTransition { from, to, .. }) => {
                assert_eq!(from, "created");
                assert_eq!(to, "archived");
            }
            other => panic!("expected illegal transition, got {other:?}"),
        }
        assert_eq!(store.get_workflow(&wf.id).unwrap().state, WorkflowState::Created);
    }

    #[test]
    fn usage_totals_are_monotone() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        store.add_workflow_usage(&wf.id, 0.25, 100).unwrap();
        store.add_workflow_usage(&wf.id, 0.75, 50).unwrap();
        let loaded = store.get_workflow(&wf.id).unwrap();
        assert!((loaded.cost_usd - 1.0).abs() < 1e-9);
        assert_eq!(loaded.total_tokens, 150);
        assert!(store.add_workflow_usage(&wf.id, -0.1, 0).is_err());
    }

    #[test]
    fn phase_lifecycle_and_uniqueness() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        let phase = PhaseRecord::new(&wf.id, PhaseName::Plan, 0, 1, 3);
        store.insert_phase(&phase).unwrap();
        // duplicate (workflow, name, attempt) violates the primary key
        assert!(store.insert_phase(&phase).is_err());

        let started = store.start_phase(&wf.id, PhaseName::Plan, 1).unwrap();
        assert_eq!(started.state, PhaseState::Running);
        assert!(started.started_at.is_some());

        let finished = store
            .finish_phase(&wf.id, PhaseName::Plan, 1, PhaseState::Completed, Some(0), None)
            .unwrap();
        assert_eq!(finished.state, PhaseState::Completed);
        assert!(finished.completed_at.is_some());
        assert!(finished.duration_seconds.is_some());

        // finished phases cannot be re-finished
        assert!(store
            .finish_phase(&wf.id, PhaseName::Plan, 1, PhaseState::Failed, None, None)
            .is_err());
    }

    #[test]
    fn skipped_is_reachable_from_pending() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Tdd);
        let phase = PhaseRecord::new(&wf.id, PhaseName::Refactor, 5, 1, 1);
        store.insert_phase(&phase).unwrap();
        let skipped = store
            .finish_phase(&wf.id, PhaseName::Refactor, 1, PhaseState::Skipped, None, None)
            .unwrap();
        assert_eq!(skipped.state, PhaseState::Skipped);
    }

    #[test]
    fn phase_usage_accumulates() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        let phase = PhaseRecord::new(&wf.id, PhaseName::Build, 1, 1, 3);
        store.insert_phase(&phase).unwrap();
        store
            .add_phase_usage(&wf.id, PhaseName::Build, 1, 1, 10, 20, 0.0003)
            .unwrap();
        store
            .add_phase_usage(&wf.id, PhaseName::Build, 1, 2, 5, 5, 0.0001)
            .unwrap();
        let loaded = store.get_phase(&wf.id, PhaseName::Build, 1).unwrap();
        assert_eq!(loaded.llm_requests, 3);
        assert_eq!(loaded.llm_tokens_in, 15);
        assert_eq!(loaded.llm_tokens_out, 25);
        assert!((loaded.cost_usd - 0.0004).abs() < 1e-9);
    }

    #[test]
    fn events_get_monotonic_seq_and_range_queries() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        let first = store
            .append_event(&Event::new(&wf.id, EventType::WorkflowCreated))
            .unwrap();
        let second = store
            .append_event(
                &Event::new(&wf.id, EventType::WorkflowStateChanged)
                    .with_transition("created", "running"),
            )
            .unwrap();
        assert!(second.seq > first.seq);

        let all = store.events_since(&wf.id, 0).unwrap();
        assert_eq!(all.len(), 2);
        let tail = store.events_since(&wf.id, first.seq).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_type, EventType::WorkflowStateChanged);
        assert_eq!(tail[0].from_state.as_deref(), Some("created"));
    }

    #[test]
    fn archive_cascades_and_is_idempotent() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        store
            .transition_workflow(&wf.id, WorkflowState::Created, WorkflowState::Running, None, None)
            .unwrap();
        store
            .transition_workflow(&wf.id, WorkflowState::Running, WorkflowState::Completed, None, None)
            .unwrap();
        let phase = PhaseRecord::new(&wf.id, PhaseName::Plan, 0, 1, 3);
        store.insert_phase(&phase).unwrap();
        store
            .append_event(&Event::new(&wf.id, EventType::WorkflowCreated))
            .unwrap();

        let archived = store.archive_workflow(&wf.id).unwrap();
        assert_eq!(archived.state, WorkflowState::Archived);
        assert!(archived.archived_at.is_some());
        assert!(store.list_phases(&wf.id).unwrap().is_empty());
        assert!(store.events_since(&wf.id, 0).unwrap().is_empty());

        // Second archive is a no-op with the same result.
        let again = store.archive_workflow(&wf.id).unwrap();
        assert_eq!(again.archived_at, archived.archived_at);
    }

    #[test]
    fn archive_from_non_terminal_is_rejected() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        assert!(matches!(
            store.archive_workflow(&wf.id),
            Err(StateError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn list_workflows_applies_filters() {
        let store = store();
        let a = make_workflow(&store, WorkflowKind::Standard);
        let b = make_workflow(&store, WorkflowKind::Tdd);
        store
            .transition_workflow(&b.id, WorkflowState::Created, WorkflowState::Running, None, None)
            .unwrap();

        let running = store
            .list_workflows(&WorkflowFilter {
                states: vec![WorkflowState::Running],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);

        let standard = store
            .list_workflows(&WorkflowFilter {
                kinds: vec![WorkflowKind::Standard],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(standard.len(), 1);
        assert_eq!(standard[0].id, a.id);

        let all = store.list_workflows(&WorkflowFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let limited = store
            .list_workflows(&WorkflowFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn list_by_tag_matches_json_element() {
        let store = store();
        let mut wf = Workflow::from_spec(
            new_workflow_id(),
            WorkflowSpec {
                name: "tagged".into(),
                kind: WorkflowKind::Standard,
                task: "t".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        wf.tags.insert("urgent".into());
        store.create_workflow(&wf).unwrap();
        make_workflow(&store, WorkflowKind::Standard);

        let tagged = store
            .list_workflows(&WorkflowFilter {
                tag: Some("urgent".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, wf.id);
    }

    #[test]
    fn ports_persist_and_clear() {
        let store = store();
        let wf = make_workflow(&store, WorkflowKind::Standard);
        store.set_ports(&wf.id, Some(9101), Some(9202)).unwrap();
        let loaded = store.get_workflow(&wf.id).unwrap();
        assert_eq!(loaded.backend_port, Some(9101));
        assert_eq!(loaded.frontend_port, Some(9202));
        store.clear_ports(&wf.id).unwrap();
        let loaded = store.get_workflow(&wf.id).unwrap();
        assert_eq!(loaded.backend_port, None);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/workflows.db");
        let id;
        {
            let store = StateStore::open(&path).unwrap();
            let wf = make_workflow(&store, WorkflowKind::Standard);
            id = wf.id;
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get_workflow(&id).unwrap().name, "demo");
        assert!(store.schema_version().unwrap() >= 2);
    }
}
