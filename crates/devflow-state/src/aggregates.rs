//! Read-only metrics rollups.
//!
//! Aggregates are recomputed on demand from the base tables; they are never
//! authoritative and never written back.

use std::collections::BTreeMap;

use devflow_types::WorkflowKind;
use rusqlite::params;
use serde::Serialize;

use crate::store::{StateError, StateStore};

/// Point-in-time totals for the operations surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub workflows_by_state: BTreeMap<String, u32>,
    pub total_workflows: u32,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub phase_duration_p50_seconds: Option<f64>,
    pub phase_duration_p95_seconds: Option<f64>,
    pub completed_last_24h: u32,
    pub failed_last_24h: u32,
}

/// Daily rollup per `(date, kind)`.
///
/// `total_cost` is the compatibility alias for the sum of `cost_usd`; the
/// column itself is canonical and nothing here reads a `total_cost` column.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsAggregate {
    /// `YYYY-MM-DD` (UTC).
    pub date: String,
    pub kind: WorkflowKind,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub avg_duration_seconds: Option<f64>,
    pub total_cost: f64,
    /// `completed / (completed + failed)`, `0.0` when nothing finished.
    pub success_rate: f64,
}

impl StateStore {
    /// Current totals across the whole store.
    pub fn metrics_snapshot(&self) -> Result<MetricsSnapshot, StateError> {
        let conn = self.lock();

        let mut workflows_by_state = BTreeMap::new();
        let mut total_workflows = 0;
        {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM workflows GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                total_workflows += count;
                workflows_by_state.insert(state, count);
            }
        }

        let (total_cost_usd, total_tokens): (f64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0), COALESCE(SUM(total_tokens), 0) FROM workflows",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut durations: Vec<f64> = {
            let mut stmt = conn.prepare(
                "SELECT duration_seconds FROM phases \
                 WHERE state = 'completed' AND duration_seconds IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, f64>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: usize| -> Option<f64> {
            if durations.is_empty() {
                None
            } else {
                let idx = (durations.len() * p / 100).min(durations.len() - 1);
                Some(durations[idx])
            }
        };
        let phase_duration_p50_seconds = percentile(50);
        let phase_duration_p95_seconds = percentile(95);

        let (completed_last_24h, failed_last_24h): (u32, u32) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0)
             FROM workflows
             WHERE completed_at IS NOT NULL
               AND julianday(completed_at) > julianday('now') - 1.0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(MetricsSnapshot {
            workflows_by_state,
            total_workflows,
            total_cost_usd,
            total_tokens: total_tokens as u64,
            phase_duration_p50_seconds,
            phase_duration_p95_seconds,
            completed_last_24h,
            failed_last_24h,
        })
    }

    /// Daily rollups for the last `days` days, newest first.
    pub fn daily_aggregates(&self, days: u32) -> Result<Vec<MetricsAggregate>, StateError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT date(created_at) AS day,
                    kind,
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN state IN ('completed','archived')
                        THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                    AVG(CASE WHEN started_at IS NOT NULL AND completed_at IS NOT NULL
                        THEN (julianday(completed_at) - julianday(started_at)) * 86400.0
                        END),
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost
             FROM workflows
             WHERE julianday(created_at) > julianday('now') - ?1
             GROUP BY day, kind
             ORDER BY day DESC, kind ASC",
        )?;
        let rows = stmt.query_map(params![f64::from(days)], |row| {
            let kind: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                kind,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;

        let mut aggregates = Vec::new();
        for row in rows {
            let (date, kind_raw, total, completed, failed, avg_duration_seconds, total_cost) =
                row?;
            let kind = WorkflowKind::parse(&kind_raw).ok_or_else(|| StateError::Corrupt {
                reason: format!("unknown workflow kind '{kind_raw}' in aggregate"),
            })?;
            let finished = completed + failed;
            let success_rate = if finished == 0 {
                0.0
            } else {
                f64::from(completed) / f64::from(finished)
            };
            aggregates.push(MetricsAggregate {
                date,
                kind,
                total,
                completed,
                failed,
                avg_duration_seconds,
                total_cost,
                success_rate,
            });
        }
        Ok(aggregates)
    }
}
