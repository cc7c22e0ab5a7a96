//! Cost accumulation and budget enforcement.
//!
//! The tracker keeps per-workflow running totals in memory; the engine
//! writes every delta through to the state store, so these totals are a
//! cache, not the source of truth. Budget checks happen *before* a provider
//! call: if the projected spend would cross the workflow's budget the call
//! is refused with [`ProviderError::BudgetExceeded`], which is permanent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::ProviderError;

/// Per-provider slice of a workflow's spend.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProviderTotals {
    pub requests: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Running totals for one workflow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowTotals {
    pub requests: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub per_provider: BTreeMap<String, ProviderTotals>,
    warned: bool,
}

/// What `record` observed while applying a delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedUsage {
    /// Total workflow cost after the delta.
    pub total_cost_usd: f64,
    /// True exactly once: the update that crossed the warning threshold.
    pub crossed_warning: bool,
}

/// Cost report for the operations surface.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub workflow_id: String,
    pub requests: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub per_provider: BTreeMap<String, ProviderTotals>,
}

/// Thread-safe accumulator with budget projection.
pub struct CostTracker {
    totals: Mutex<HashMap<String, WorkflowTotals>>,
    warning_threshold: f64,
}

impl CostTracker {
    /// `warning_threshold` is the budget fraction at which a one-shot
    /// warning is reported (0.8 means "warn at 80% spent").
    #[must_use]
    pub fn new(warning_threshold: f64) -> Self {
        Self {
            totals: Mutex::new(HashMap::new()),
            warning_threshold,
        }
    }

    /// Apply a provider response's usage to the workflow totals.
    pub fn record(
        &self,
        workflow_id: &str,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
        budget_usd: Option<f64>,
    ) -> RecordedUsage {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        let entry = totals.entry(workflow_id.to_string()).or_default();
        entry.requests += 1;
        entry.tokens_in += tokens_in;
        entry.tokens_out += tokens_out;
        entry.cost_usd += cost_usd;

        let provider_entry = entry.per_provider.entry(provider.to_string()).or_default();
        provider_entry.requests += 1;
        provider_entry.tokens_in += tokens_in;
        provider_entry.tokens_out += tokens_out;
        provider_entry.cost_usd += cost_usd;

        let crossed_warning = match budget_usd {
            Some(budget) if budget > 0.0 && !entry.warned => {
                if entry.cost_usd >= budget * self.warning_threshold {
                    entry.warned = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        RecordedUsage {
            total_cost_usd: entry.cost_usd,
            crossed_warning,
        }
    }

    /// Refuse the next call if its projected cost would exceed the budget.
    pub fn check_budget(
        &self,
        workflow_id: &str,
        budget_usd: Option<f64>,
        projected_call_cost_usd: f64,
    ) -> Result<(), ProviderError> {
        let Some(budget) = budget_usd else {
            return Ok(());
        };
        let spent = self.workflow_cost(workflow_id);
        let projected = spent + projected_call_cost_usd;
        if projected > budget {
            return Err(ProviderError::BudgetExceeded {
                workflow_id: workflow_id.to_string(),
                budget_usd: budget,
                projected_usd: projected,
            });
        }
        Ok(())
    }

    /// Current spend for a workflow; zero when unknown.
    #[must_use]
    pub fn workflow_cost(&self, workflow_id: &str) -> f64 {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .map_or(0.0, |t| t.cost_usd)
    }

    /// Full breakdown for one workflow, if any usage has been recorded.
    #[must_use]
    pub fn report(&self, workflow_id: &str) -> Option<CostReport> {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .map(|t| CostReport {
                workflow_id: workflow_id.to_string(),
                requests: t.requests,
                tokens_in: t.tokens_in,
                tokens_out: t.tokens_out,
                cost_usd: t.cost_usd,
                per_provider: t.per_provider.clone(),
            })
    }

    /// Drop a workflow's totals; used when it is archived.
    pub fn clear_workflow(&self, workflow_id: &str) {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_per_workflow_and_provider() {
        let tracker = CostTracker::new(0.8);
        tracker.record("wf-1", "claude", 10, 20, 0.001, None);
        tracker.record("wf-1", "openai", 5, 5, 0.002, None);
        tracker.record("wf-2", "claude", 1, 1, 0.5, None);

        let report = tracker.report("wf-1").unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.tokens_in, 15);
        assert_eq!(report.tokens_out, 25);
        assert!((report.cost_usd - 0.003).abs() < 1e-9);
        assert_eq!(report.per_provider.len(), 2);
        assert_eq!(report.per_provider["claude"].requests, 1);

        assert!((tracker.workflow_cost("wf-2") - 0.5).abs() < 1e-9);
        assert!(tracker.report("wf-none").is_none());
    }

    #[test]
    fn warning_fires_exactly_once() {
        let tracker = CostTracker::new(0.8);
        let budget = Some(1.0);
        let first = tracker.record("wf-1", "claude", 0, 0, 0.5, budget);
        assert!(!first.crossed_warning);
        let second = tracker.record("wf-1", "claude", 0, 0, 0.4, budget);
        assert!(second.crossed_warning);
        let third = tracker.record("wf-1", "claude", 0, 0, 0.05, budget);
        assert!(!third.crossed_warning);
    }

    #[test]
    fn budget_projection_refuses_overruns() {
        let tracker = CostTracker::new(0.8);
        tracker.record("wf-1", "claude", 0, 0, 0.9, Some(1.0));
        assert!(tracker.check_budget("wf-1", Some(1.0), 0.05).is_ok());
        match tracker.check_budget("wf-1", Some(1.0), 0.2) {
            Err(ProviderError::BudgetExceeded {
                budget_usd,
                projected_usd,
                ..
            }) => {
                assert!((budget_usd - 1.0).abs() < 1e-9);
                assert!((projected_usd - 1.1).abs() < 1e-9);
            }
            other => panic!("expected budget refusal, got {other:?}"),
        }
        // No budget, no ceiling.
        assert!(tracker.check_budget("wf-1", None, 100.0).is_ok());
    }

    #[test]
    fn clearing_a_workflow_resets_its_totals() {
        let tracker = CostTracker::new(0.8);
        tracker.record("wf-1", "claude", 1, 1, 0.1, None);
        tracker.clear_workflow("wf-1");
        assert_eq!(tracker.workflow_cost("wf-1"), 0.0);
    }
}
