//! Additive, idempotent schema migrations.
//!
//! Every migration uses `IF NOT EXISTS` (or an equivalent guard) so that
//! re-running it is harmless; the `schema_version` table records which
//! versions have been applied.

use rusqlite::Connection;
use tracing::info;

/// Ordered list of migrations. Never reorder or edit a shipped entry; add a
/// new version instead.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN
                ('standard','tdd','plan-only','test-only','review-only')),
            state TEXT NOT NULL CHECK (state IN
                ('created','initialized','running','paused','completed',
                 'failed','cancelled','stuck','archived')),
            task TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            last_activity_at TEXT NOT NULL,
            completed_at TEXT,
            archived_at TEXT,
            issue_ref TEXT,
            branch TEXT,
            base_branch TEXT NOT NULL DEFAULT 'main',
            worktree_path TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            exit_code INTEGER,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            cost_usd REAL NOT NULL DEFAULT 0.0 CHECK (cost_usd >= 0.0),
            total_tokens INTEGER NOT NULL DEFAULT 0 CHECK (total_tokens >= 0),
            phase_count INTEGER NOT NULL DEFAULT 0 CHECK (phase_count >= 0),
            backend_port INTEGER CHECK
                (backend_port IS NULL OR backend_port BETWEEN 9100 AND 9199),
            frontend_port INTEGER CHECK
                (frontend_port IS NULL OR frontend_port BETWEEN 9200 AND 9299),
            issue_class TEXT CHECK (issue_class IS NULL OR issue_class IN
                ('feature','bug','test','refactor','docs','chore')),
            model_set TEXT NOT NULL DEFAULT 'base'
                CHECK (model_set IN ('base','fast','powerful')),
            budget_usd REAL CHECK (budget_usd IS NULL OR budget_usd >= 0.0),
            CHECK ((state = 'archived') = (archived_at IS NOT NULL))
        );

        CREATE TABLE IF NOT EXISTS phases (
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            name TEXT NOT NULL CHECK (name IN
                ('plan','build','test','review','deploy','generate_tests',
                 'verify_red','verify_green','refactor')),
            attempt INTEGER NOT NULL CHECK (attempt >= 1),
            idx INTEGER NOT NULL CHECK (idx >= 0),
            state TEXT NOT NULL CHECK (state IN
                ('pending','running','completed','failed','skipped')),
            started_at TEXT,
            completed_at TEXT,
            duration_seconds REAL,
            exit_code INTEGER,
            error_message TEXT,
            max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
            llm_requests INTEGER NOT NULL DEFAULT 0 CHECK (llm_requests >= 0),
            llm_tokens_in INTEGER NOT NULL DEFAULT 0 CHECK (llm_tokens_in >= 0),
            llm_tokens_out INTEGER NOT NULL DEFAULT 0 CHECK (llm_tokens_out >= 0),
            cost_usd REAL NOT NULL DEFAULT 0.0 CHECK (cost_usd >= 0.0),
            PRIMARY KEY (workflow_id, name, attempt)
        );

        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL CHECK (event_type IN
                ('workflow_created','workflow_state_changed','phase_started',
                 'phase_completed','phase_failed','workflow_paused',
                 'workflow_resumed','workflow_cancelled','workflow_archived',
                 'resource_allocated','resource_released','error_occurred')),
            phase_name TEXT,
            from_state TEXT,
            to_state TEXT,
            severity TEXT NOT NULL DEFAULT 'INFO'
                CHECK (severity IN ('INFO','WARN','ERROR')),
            message TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE INDEX IF NOT EXISTS idx_workflows_state ON workflows(state);
        CREATE INDEX IF NOT EXISTS idx_workflows_created_at ON workflows(created_at);
        CREATE INDEX IF NOT EXISTS idx_workflows_last_activity ON workflows(last_activity_at);
        CREATE INDEX IF NOT EXISTS idx_workflows_kind ON workflows(kind);
        CREATE INDEX IF NOT EXISTS idx_workflows_state_created ON workflows(state, created_at);
        CREATE INDEX IF NOT EXISTS idx_workflows_issue_ref ON workflows(issue_ref);
        CREATE INDEX IF NOT EXISTS idx_workflows_backend_port ON workflows(backend_port);
        CREATE INDEX IF NOT EXISTS idx_workflows_frontend_port ON workflows(frontend_port);
        CREATE INDEX IF NOT EXISTS idx_workflows_issue_class ON workflows(issue_class);
        CREATE INDEX IF NOT EXISTS idx_phases_workflow ON phases(workflow_id, idx, attempt);
        CREATE INDEX IF NOT EXISTS idx_events_workflow_seq ON events(workflow_id, seq);
        "#,
    ),
];

/// Apply any unapplied migrations, in version order, each in its own
/// transaction.
pub(crate) fn run(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    for (version, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_version WHERE version = ?1)",
            [version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(version, "applied schema migration");
    }
    Ok(())
}

/// Highest applied migration version.
pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let first = current_version(&conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), first);
        assert_eq!(first, MIGRATIONS.last().unwrap().0);
    }

    #[test]
    fn archival_invariant_is_enforced() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        // archived_at without state = archived must be rejected.
        let result = conn.execute(
            "INSERT INTO workflows (id, name, kind, state, task, created_at,
                last_activity_at, archived_at)
             VALUES ('wf-x', 'n', 'standard', 'created', 't', '2026-01-01T00:00:00Z',
                '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn port_range_checks_are_enforced() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let result = conn.execute(
            "INSERT INTO workflows (id, name, kind, state, task, created_at,
                last_activity_at, backend_port)
             VALUES ('wf-x', 'n', 'standard', 'created', 't', '2026-01-01T00:00:00Z',
                '2026-01-01T00:00:00Z', 8080)",
            [],
        );
        assert!(result.is_err());
    }
}
