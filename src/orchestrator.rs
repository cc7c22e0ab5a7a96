//! The stable façade over the devflow component stack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use devflow_bus::{BusOptions, EventBus};
use devflow_config::Config;
use devflow_engine::{HealthReport, RecoveryReport, WorkflowEngine};
use devflow_llm::{CostReport, ProviderRegistry};
use devflow_state::{MetricsAggregate, MetricsSnapshot, StateStore};
use devflow_types::{Event, Workflow, WorkflowFilter, WorkflowSpec};
use tokio::task::JoinHandle;
use tracing::info;

/// Everything wired and running: state, bus (with journal), registry,
/// engine, recovery done, reaper ticking.
pub struct Orchestrator {
    engine: WorkflowEngine,
    store: Arc<StateStore>,
    bus: EventBus,
    recovery: RecoveryReport,
    reaper: JoinHandle<()>,
}

impl Orchestrator {
    /// Bring the stack up from configuration, rooted at `workspace`.
    ///
    /// Builds the HTTP provider registry from `providers.*`; use
    /// [`Orchestrator::bootstrap_with_registry`] to inject your own clients
    /// (tests do).
    pub async fn bootstrap(config: Config, workspace: &Utf8Path) -> Result<Self> {
        let registry =
            ProviderRegistry::from_config(&config).context("building provider registry")?;
        Self::bootstrap_with_registry(config, workspace, Arc::new(registry)).await
    }

    /// Bring the stack up with a caller-supplied provider registry.
    pub async fn bootstrap_with_registry(
        config: Config,
        workspace: &Utf8Path,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self> {
        let db_path: Utf8PathBuf = workspace.join(&config.state.db_path);
        let store = Arc::new(StateStore::open(&db_path).context("opening state store")?);

        let bus = EventBus::new(BusOptions {
            max_workers: config.events.max_workers,
            slow_handler: Duration::from_millis(config.events.slow_handler_ms),
            ..BusOptions::default()
        });
        if let Some(journal) = &config.events.journal_path {
            let journal_path = workspace.join(journal);
            bus.attach_journal(&journal_path)
                .context("attaching event journal")?;
            info!(path = %journal_path, "event journal attached");
        }

        let engine = WorkflowEngine::new(Arc::clone(&store), bus.clone(), registry, &config)
            .context("constructing workflow engine")?;
        let recovery = engine.recover().context("startup recovery scan")?;
        if recovery != RecoveryReport::default() {
            info!(
                workflows_paused = recovery.workflows_paused,
                phases_interrupted = recovery.phases_interrupted,
                ports_reclaimed = recovery.ports_reclaimed,
                "recovered interrupted state"
            );
        }
        let reaper = engine.spawn_reaper();

        Ok(Self {
            engine,
            store,
            bus,
            recovery,
            reaper,
        })
    }

    /// What the startup recovery scan found.
    #[must_use]
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// The engine, for operations the façade does not wrap.
    #[must_use]
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// The event bus, for subscribing to live events.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ------------------------------------------------------------------
    // Workflow operations
    // ------------------------------------------------------------------

    pub async fn create(&self, spec: WorkflowSpec) -> Result<String> {
        Ok(self.engine.create(spec).await?)
    }

    pub fn start(&self, workflow_id: &str) -> Result<()> {
        Ok(self.engine.start(workflow_id)?)
    }

    pub fn pause(&self, workflow_id: &str) -> Result<()> {
        Ok(self.engine.pause(workflow_id)?)
    }

    pub fn resume(&self, workflow_id: &str) -> Result<()> {
        Ok(self.engine.resume(workflow_id)?)
    }

    pub fn cancel(&self, workflow_id: &str, reason: &str) -> Result<()> {
        Ok(self.engine.cancel(workflow_id, reason)?)
    }

    pub async fn archive(&self, workflow_id: &str) -> Result<Workflow> {
        Ok(self.engine.archive(workflow_id).await?)
    }

    pub fn get(&self, workflow_id: &str) -> Result<Workflow> {
        Ok(self.engine.get(workflow_id)?)
    }

    pub fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        Ok(self.engine.list(filter)?)
    }

    pub fn events(&self, workflow_id: &str, since_seq: Option<i64>) -> Result<Vec<Event>> {
        Ok(self.engine.events(workflow_id, since_seq)?)
    }

    /// Block until the workflow's supervising task has finished its current
    /// run (completed, failed, paused, or cancelled).
    pub async fn wait_idle(&self, workflow_id: &str) {
        self.engine.wait_idle(workflow_id).await;
    }

    // ------------------------------------------------------------------
    // Observability surface
    // ------------------------------------------------------------------

    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.engine.health()
    }

    pub fn metrics(&self) -> Result<MetricsSnapshot> {
        Ok(self.store.metrics_snapshot()?)
    }

    pub fn daily_metrics(&self, days: u32) -> Result<Vec<MetricsAggregate>> {
        Ok(self.store.daily_aggregates(days)?)
    }

    #[must_use]
    pub fn cost_report(&self, workflow_id: &str) -> Option<CostReport> {
        self.engine.cost_report(workflow_id)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}
