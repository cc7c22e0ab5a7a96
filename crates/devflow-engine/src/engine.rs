use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devflow_bus::EventBus;
use devflow_config::{Config, ConsensusConfig, ProviderConfig, RoutingDecision};
use devflow_consensus::{ConsensusEngine, ConsensusError, SynthesizerSpec};
use devflow_llm::{
    CancelSource, CancelToken, CostTracker, ProviderError, ProviderRegistry, ProviderRequest,
};
use devflow_router::{RouteKey, Router, RouterError};
use devflow_state::StateStore;
use devflow_types::{
    new_workflow_id, Classified, ErrorClass, Event, EventType, PhaseName, PhaseRecord, PhaseState,
    Severity, Workflow, WorkflowFilter, WorkflowSpec, WorkflowState,
};
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::collab::{IssueSource, Workspace};
use crate::health::{ComponentHealth, HealthReport};
use crate::plan::{build_messages, evaluate_verify, is_optional, phases_for};
use crate::ports::PortAllocator;
use crate::EngineError;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Engine tuning, derived from configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub default_max_attempts: u32,
    pub provider_call_timeout: Duration,
    pub phase_timeout: Duration,
    pub workflow_timeout: Option<Duration>,
    pub stuck_threshold: Duration,
    pub reaper_interval: Duration,
    pub default_budget_usd: Option<f64>,
}

impl EngineOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_max_attempts: config.engine.default_max_attempts,
            provider_call_timeout: Duration::from_secs(config.engine.provider_call_timeout_seconds),
            phase_timeout: Duration::from_secs(config.engine.phase_timeout_seconds),
            workflow_timeout: config
                .engine
                .workflow_timeout_seconds
                .map(Duration::from_secs),
            stuck_threshold: Duration::from_secs(config.engine.stuck_threshold_seconds),
            reaper_interval: Duration::from_secs(config.engine.reaper_interval_seconds),
            default_budget_usd: config.budgets.default_usd,
        }
    }
}

struct WorkflowHandle {
    cancel: CancelSource,
    pause: watch::Sender<bool>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<StateStore>,
    pub(crate) bus: EventBus,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) router: Router,
    pub(crate) consensus_groups: BTreeMap<String, ConsensusConfig>,
    pub(crate) provider_configs: BTreeMap<String, ProviderConfig>,
    pub(crate) tracker: CostTracker,
    pub(crate) ports: PortAllocator,
    pub(crate) options: EngineOptions,
    active: Mutex<HashMap<String, WorkflowHandle>>,
    issue_source: Option<Arc<dyn IssueSource>>,
    #[allow(dead_code)] // Held for injected workspace adapters; exercised by callers.
    workspace: Option<Arc<dyn Workspace>>,
}

/// The workflow engine. Cheap to clone; all clones share one state machine
/// universe.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        store: Arc<StateStore>,
        bus: EventBus,
        registry: Arc<ProviderRegistry>,
        config: &Config,
    ) -> Result<Self, EngineError> {
        // A provider-less deployment (state inspection, journal tooling) has
        // nothing to route to; give it a placeholder default so read-only
        // operations still work. Any execution attempt then fails cleanly
        // with an unknown-provider lookup error.
        let router = match Router::from_config(&config.router) {
            Ok(router) => router,
            Err(RouterError::MissingDefault) if config.providers.is_empty() => {
                let mut fallback = config.router.clone();
                fallback.default = Some(RoutingDecision {
                    provider: "unconfigured".to_string(),
                    model: None,
                    temperature: None,
                    max_tokens: None,
                    use_consensus: false,
                    consensus: None,
                });
                Router::from_config(&fallback)?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                bus,
                registry,
                router,
                consensus_groups: config
                    .consensus
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                provider_configs: config
                    .providers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                tracker: CostTracker::new(config.budgets.warning_threshold),
                ports: PortAllocator::new(&config.engine.port_ranges),
                options: EngineOptions::from_config(config),
                active: Mutex::new(HashMap::new()),
                issue_source: None,
                workspace: None,
            }),
        })
    }

    /// Inject an issue-tracker adapter. Must be called before workflows run.
    pub fn with_issue_source(mut self, issue_source: Arc<dyn IssueSource>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("wire collaborators before cloning");
        inner.issue_source = Some(issue_source);
        self
    }

    /// Inject a version-control adapter. Must be called before workflows run.
    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("wire collaborators before cloning");
        inner.workspace = Some(workspace);
        self
    }

    // ------------------------------------------------------------------
    // Operations surface
    // ------------------------------------------------------------------

    /// Persist a new workflow in `created` and publish `workflow_created`.
    pub async fn create(&self, mut spec: WorkflowSpec) -> Result<String, EngineError> {
        if spec.name.trim().is_empty() {
            return Err(EngineError::InvalidSpec {
                reason: "workflow name must not be empty".to_string(),
            });
        }
        if spec.task.trim().is_empty() {
            return Err(EngineError::InvalidSpec {
                reason: "task description must not be empty".to_string(),
            });
        }
        if spec.budget_usd.is_none() {
            spec.budget_usd = self.inner.options.default_budget_usd;
        }

        // Enrich from the issue tracker when we have one; best effort.
        if let (Some(issue_ref), Some(source)) = (&spec.issue_ref, &self.inner.issue_source) {
            match source.fetch(issue_ref).await {
                Ok(details) => {
                    spec.metadata
                        .insert("issue_title".to_string(), json!(details.title));
                    spec.metadata
                        .insert("issue_labels".to_string(), json!(details.labels));
                }
                Err(e) => {
                    warn!(issue_ref = %issue_ref, error = %e, "issue fetch failed; continuing");
                }
            }
        }

        let id = new_workflow_id();
        let workflow = Workflow::from_spec(id.clone(), spec, chrono::Utc::now());
        self.inner.store.create_workflow(&workflow)?;

        let event = Event::new(&id, EventType::WorkflowCreated).with_metadata(json!({
            "name": workflow.name,
            "kind": workflow.kind.as_str(),
            "task": workflow.task,
            "model_set": workflow.model_set.as_str(),
            "tags": workflow.tags,
            "budget_usd": workflow.budget_usd,
        }));
        self.inner.emit(event);
        info!(workflow_id = %id, kind = %workflow.kind, "workflow created");
        Ok(id)
    }

    /// Move `created|initialized → running` and begin phase execution.
    pub fn start(&self, workflow_id: &str) -> Result<(), EngineError> {
        let workflow = self.inner.store.get_workflow(workflow_id)?;
        match workflow.state {
            WorkflowState::Created | WorkflowState::Initialized => {}
            other => {
                return Err(EngineError::State(devflow_state::StateError::IllegalTransition {
                    id: workflow_id.to_string(),
                    from: other.to_string(),
                    to: WorkflowState::Running.to_string(),
                }))
            }
        }
        self.inner
            .transition(workflow_id, workflow.state, WorkflowState::Running, None, None)?;
        self.spawn_supervisor(workflow_id);
        Ok(())
    }

    /// Request a cooperative pause; honored at the next phase boundary.
    pub fn pause(&self, workflow_id: &str) -> Result<(), EngineError> {
        let flagged = {
            let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            match active.get(workflow_id) {
                Some(handle) => {
                    let _ = handle.pause.send(true);
                    true
                }
                None => false,
            }
        };
        if !flagged {
            // No supervisor (e.g. recovered after a crash): flip the row.
            self.inner.transition(
                workflow_id,
                WorkflowState::Running,
                WorkflowState::Paused,
                None,
                None,
            )?;
        }
        Ok(())
    }

    /// Resume a paused (or stuck) workflow from its next incomplete phase.
    pub fn resume(&self, workflow_id: &str) -> Result<(), EngineError> {
        let workflow = self.inner.store.get_workflow(workflow_id)?;
        let from = match workflow.state {
            WorkflowState::Paused | WorkflowState::Stuck => workflow.state,
            other => {
                return Err(EngineError::State(devflow_state::StateError::IllegalTransition {
                    id: workflow_id.to_string(),
                    from: other.to_string(),
                    to: WorkflowState::Running.to_string(),
                }))
            }
        };
        self.inner
            .transition(workflow_id, from, WorkflowState::Running, None, None)?;
        self.inner.emit(Event::new(workflow_id, EventType::WorkflowResumed));
        self.spawn_supervisor(workflow_id);
        Ok(())
    }

    /// Request cooperative cancellation. In-flight provider calls observe
    /// the token; the supervising task finalizes the workflow once they
    /// return. Workflows without a supervisor are cancelled directly.
    pub fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        let signalled = {
            let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            match active.get(workflow_id) {
                Some(handle) => {
                    handle.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        if !signalled {
            let workflow = self.inner.store.get_workflow(workflow_id)?;
            self.inner.transition(
                workflow_id,
                workflow.state,
                WorkflowState::Cancelled,
                Some(130),
                Some(reason),
            )?;
            self.inner
                .emit(Event::new(workflow_id, EventType::WorkflowCancelled).with_message(reason));
            self.inner.release_workflow_ports(workflow_id);
        }
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        Ok(self.inner.store.get_workflow(workflow_id)?)
    }

    pub fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.inner.store.list_workflows(filter)?)
    }

    /// Archive a terminal workflow: cascade-deletes phases and events.
    pub async fn archive(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let workflow = self.inner.store.archive_workflow(workflow_id)?;
        self.inner
            .ports
            .release(workflow.backend_port, workflow.frontend_port);
        self.inner.tracker.clear_workflow(workflow_id);
        // The audit rows are gone with the cascade; the bus (and journal)
        // still announce the archival to live subscribers.
        self.inner
            .bus
            .publish(Event::new(workflow_id, EventType::WorkflowArchived));
        Ok(workflow)
    }

    /// Ordered event stream for a workflow.
    pub fn events(
        &self,
        workflow_id: &str,
        since_seq: Option<i64>,
    ) -> Result<Vec<Event>, EngineError> {
        Ok(self
            .inner
            .store
            .events_since(workflow_id, since_seq.unwrap_or(0))?)
    }

    /// Allocate a backend dev-server port for the workflow.
    pub fn allocate_backend_port(&self, workflow_id: &str) -> Result<u16, EngineError> {
        let port = self.inner.ports.allocate_backend()?;
        if let Err(e) = self.inner.store.set_ports(workflow_id, Some(port), None) {
            self.inner.ports.release(Some(port), None);
            return Err(e.into());
        }
        self.inner.emit(
            Event::new(workflow_id, EventType::ResourceAllocated)
                .with_metadata(json!({"resource": "backend_port", "port": port})),
        );
        Ok(port)
    }

    /// Allocate a frontend dev-server port for the workflow.
    pub fn allocate_frontend_port(&self, workflow_id: &str) -> Result<u16, EngineError> {
        let port = self.inner.ports.allocate_frontend()?;
        if let Err(e) = self.inner.store.set_ports(workflow_id, None, Some(port)) {
            self.inner.ports.release(None, Some(port));
            return Err(e.into());
        }
        self.inner.emit(
            Event::new(workflow_id, EventType::ResourceAllocated)
                .with_metadata(json!({"resource": "frontend_port", "port": port})),
        );
        Ok(port)
    }

    /// Logical component health.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            state: if self.inner.store.healthy() {
                ComponentHealth::Healthy
            } else {
                ComponentHealth::Unhealthy
            },
            events: if self.inner.bus.is_running() {
                ComponentHealth::Healthy
            } else {
                ComponentHealth::Unhealthy
            },
            registry: if self.inner.registry.is_empty() {
                ComponentHealth::Degraded
            } else {
                ComponentHealth::Healthy
            },
        }
    }

    /// Cost breakdown for one workflow, if any usage has been recorded.
    #[must_use]
    pub fn cost_report(&self, workflow_id: &str) -> Option<devflow_llm::CostReport> {
        self.inner.tracker.report(workflow_id)
    }

    /// Wait for a workflow's supervising task to finish. Test support and
    /// orderly shutdown; returns immediately when none is running.
    pub async fn wait_idle(&self, workflow_id: &str) {
        loop {
            let running = {
                let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
                active.contains_key(workflow_id)
            };
            if !running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_supervisor(&self, workflow_id: &str) {
        let cancel = CancelSource::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                workflow_id.to_string(),
                WorkflowHandle {
                    cancel: cancel.clone(),
                    pause: pause_tx,
                },
            );
        }
        let inner = Arc::clone(&self.inner);
        let id = workflow_id.to_string();
        let token = cancel.token();
        tokio::spawn(async move {
            run_workflow(Arc::clone(&inner), id.clone(), token, pause_rx).await;
            let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&id);
        });
    }
}

impl EngineInner {
    /// Persist an event, then publish it. The store assigns `seq`; the
    /// published copy carries it, so subscribers always observe committed
    /// rows. Event failures are logged, never fatal to the workflow.
    pub(crate) fn emit(&self, event: Event) {
        match self.store.append_event(&event) {
            Ok(stored) => self.bus.publish(stored),
            Err(e) => error!(workflow_id = %event.workflow_id, error = %e, "failed to persist event"),
        }
    }

    /// CAS transition + `workflow_state_changed` event, commit-then-publish.
    pub(crate) fn transition(
        &self,
        workflow_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<Workflow, EngineError> {
        let workflow = self
            .store
            .transition_workflow(workflow_id, from, to, exit_code, error_message)?;
        let mut metadata = serde_json::Map::new();
        if let Some(code) = exit_code {
            metadata.insert("exit_code".to_string(), json!(code));
        }
        if let Some(message) = error_message {
            metadata.insert("error_message".to_string(), json!(message));
        }
        let mut event = Event::new(workflow_id, EventType::WorkflowStateChanged)
            .with_transition(from.as_str(), to.as_str());
        if !metadata.is_empty() {
            event = event.with_metadata(serde_json::Value::Object(metadata));
        }
        self.emit(event);
        Ok(workflow)
    }

    pub(crate) fn release_workflow_ports(&self, workflow_id: &str) {
        let Ok(workflow) = self.store.get_workflow(workflow_id) else {
            return;
        };
        if workflow.backend_port.is_none() && workflow.frontend_port.is_none() {
            return;
        }
        self.ports
            .release(workflow.backend_port, workflow.frontend_port);
        if let Err(e) = self.store.clear_ports(workflow_id) {
            warn!(workflow_id, error = %e, "failed to clear port bindings");
        }
        self.emit(Event::new(workflow_id, EventType::ResourceReleased));
    }
}

/// Why a phase (and possibly the workflow) stopped.
enum PhaseFailure {
    /// The workflow was cancelled mid-phase.
    Cancelled,
    /// The phase failed for good; the workflow fails with this message.
    Fatal { message: String },
    /// An optional phase ran out of attempts and was skipped.
    Skipped,
}

/// The supervising task: sequences one workflow's phases.
async fn run_workflow(
    inner: Arc<EngineInner>,
    workflow_id: String,
    cancel: CancelToken,
    pause_rx: watch::Receiver<bool>,
) {
    let workflow = match inner.store.get_workflow(&workflow_id) {
        Ok(workflow) => workflow,
        Err(e) => {
            error!(workflow_id = %workflow_id, error = %e, "supervisor could not load workflow");
            return;
        }
    };
    let plan = phases_for(workflow.kind);
    let deadline = inner
        .options
        .workflow_timeout
        .map(|limit| tokio::time::Instant::now() + limit);

    // A resumed workflow continues after its last completed (or skipped)
    // phase; finished attempts are never re-run.
    let finished: Vec<PhaseName> = match inner.store.list_phases(&workflow_id) {
        Ok(phases) => phases
            .iter()
            .filter(|p| matches!(p.state, PhaseState::Completed | PhaseState::Skipped))
            .map(|p| p.name)
            .collect(),
        Err(e) => {
            error!(workflow_id = %workflow_id, error = %e, "supervisor could not list phases");
            return;
        }
    };

    let mut completed: Vec<PhaseName> = finished.clone();
    for (index, phase) in plan.iter().enumerate() {
        if finished.contains(phase) {
            continue;
        }

        // Boundary checks: pause and cancel are honored between phases,
        // never mid-call.
        if *pause_rx.borrow() {
            finalize_pause(&inner, &workflow_id);
            return;
        }
        if cancel.is_cancelled() {
            finalize_cancel(&inner, &workflow_id);
            return;
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                finalize_failure(&inner, &workflow_id, "workflow timeout");
                return;
            }
        }

        match execute_phase(&inner, &workflow_id, *phase, index as u32, &cancel).await {
            Ok(()) => completed.push(*phase),
            Err(PhaseFailure::Skipped) => completed.push(*phase),
            Err(PhaseFailure::Cancelled) => {
                finalize_cancel(&inner, &workflow_id);
                return;
            }
            Err(PhaseFailure::Fatal { message }) => {
                finalize_failure(&inner, &workflow_id, &message);
                return;
            }
        }
    }

    if let Err(e) = inner.transition(
        &workflow_id,
        WorkflowState::Running,
        WorkflowState::Completed,
        Some(0),
        None,
    ) {
        error!(workflow_id = %workflow_id, error = %e, "failed to finalize completed workflow");
        return;
    }
    inner.release_workflow_ports(&workflow_id);
    info!(workflow_id = %workflow_id, phases = completed.len(), "workflow completed");
}

fn finalize_pause(inner: &EngineInner, workflow_id: &str) {
    match inner.transition(
        workflow_id,
        WorkflowState::Running,
        WorkflowState::Paused,
        None,
        None,
    ) {
        Ok(_) => inner.emit(Event::new(workflow_id, EventType::WorkflowPaused)),
        Err(e) => error!(workflow_id = %workflow_id, error = %e, "failed to pause workflow"),
    }
}

fn finalize_cancel(inner: &EngineInner, workflow_id: &str) {
    match inner.transition(
        workflow_id,
        WorkflowState::Running,
        WorkflowState::Cancelled,
        Some(130),
        Some("cancelled"),
    ) {
        Ok(_) => {
            inner.emit(
                Event::new(workflow_id, EventType::WorkflowCancelled).with_message("cancelled"),
            );
            inner.release_workflow_ports(workflow_id);
        }
        Err(e) => error!(workflow_id = %workflow_id, error = %e, "failed to cancel workflow"),
    }
}

fn finalize_failure(inner: &EngineInner, workflow_id: &str, message: &str) {
    match inner.transition(
        workflow_id,
        WorkflowState::Running,
        WorkflowState::Failed,
        Some(1),
        Some(message),
    ) {
        Ok(_) => inner.release_workflow_ports(workflow_id),
        Err(e) => error!(workflow_id = %workflow_id, error = %e, "failed to finalize failed workflow"),
    }
}

/// Execute one phase, including its retry loop, under the phase timeout.
async fn execute_phase(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    phase: PhaseName,
    index: u32,
    cancel: &CancelToken,
) -> Result<(), PhaseFailure> {
    let phase_timeout = inner.options.phase_timeout;
    match tokio::time::timeout(
        phase_timeout,
        run_phase_attempts(inner, workflow_id, phase, index, cancel),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            // The attempt that was in flight is still `running`; close it.
            let message = format!("phase timed out after {}s", phase_timeout.as_secs());
            if let Ok(running) = inner.store.running_phases(workflow_id) {
                for record in running.iter().filter(|p| p.name == phase) {
                    let _ = inner.store.finish_phase(
                        workflow_id,
                        phase,
                        record.attempt,
                        PhaseState::Failed,
                        Some(1),
                        Some(&message),
                    );
                    inner.emit(
                        Event::new(workflow_id, EventType::PhaseFailed)
                            .with_phase(phase)
                            .with_severity(Severity::Error)
                            .with_message(&message)
                            .with_metadata(json!({
                                "attempt": record.attempt,
                                "index": index,
                                "max_attempts": record.max_attempts,
                            })),
                    );
                }
            }
            Err(PhaseFailure::Fatal { message })
        }
    }
}

async fn run_phase_attempts(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    phase: PhaseName,
    index: u32,
    cancel: &CancelToken,
) -> Result<(), PhaseFailure> {
    let max_attempts = inner.options.default_max_attempts.max(1);
    let mut attempt = next_attempt(inner, workflow_id, phase);

    loop {
        let workflow = inner
            .store
            .get_workflow(workflow_id)
            .map_err(|e| PhaseFailure::Fatal {
                message: e.to_string(),
            })?;

        let record = PhaseRecord::new(workflow_id, phase, index, attempt, max_attempts);
        inner
            .store
            .insert_phase(&record)
            .and_then(|()| inner.store.increment_phase_count(workflow_id))
            .map_err(|e| PhaseFailure::Fatal {
                message: e.to_string(),
            })?;
        inner
            .store
            .start_phase(workflow_id, phase, attempt)
            .map_err(|e| PhaseFailure::Fatal {
                message: e.to_string(),
            })?;
        inner.emit(
            Event::new(workflow_id, EventType::PhaseStarted)
                .with_phase(phase)
                .with_metadata(json!({
                    "attempt": attempt,
                    "index": index,
                    "max_attempts": max_attempts,
                })),
        );

        let completed: Vec<PhaseName> = inner
            .store
            .list_phases(workflow_id)
            .map(|phases| {
                phases
                    .iter()
                    .filter(|p| p.state == PhaseState::Completed)
                    .map(|p| p.name)
                    .collect()
            })
            .unwrap_or_default();

        let outcome = call_providers(inner, &workflow, phase, &completed, cancel).await;

        match outcome {
            Ok(usage) => {
                apply_usage(inner, &workflow, phase, attempt, &usage);

                if let Err(message) = evaluate_verify(phase, &usage.text) {
                    finish_failed(inner, workflow_id, phase, attempt, index, max_attempts, &message, &usage);
                    return Err(PhaseFailure::Fatal { message });
                }

                let _ = inner.store.finish_phase(
                    workflow_id,
                    phase,
                    attempt,
                    PhaseState::Completed,
                    Some(0),
                    None,
                );
                let _ = inner.store.touch_activity(workflow_id);
                inner.emit(
                    Event::new(workflow_id, EventType::PhaseCompleted)
                        .with_phase(phase)
                        .with_metadata(json!({
                            "attempt": attempt,
                            "index": index,
                            "max_attempts": max_attempts,
                            "exit_code": 0,
                            "requests": usage.requests,
                            "tokens_in": usage.tokens_in,
                            "tokens_out": usage.tokens_out,
                            "cost_usd": usage.cost_usd,
                        })),
                );
                return Ok(());
            }
            Err(call_error) => {
                let cancelled = call_error.is_cancelled() || cancel.is_cancelled();
                let message = if cancelled {
                    "cancelled".to_string()
                } else {
                    call_error.to_string()
                };
                finish_failed(
                    inner,
                    workflow_id,
                    phase,
                    attempt,
                    index,
                    max_attempts,
                    &message,
                    &PhaseUsage::default(),
                );

                if cancelled {
                    return Err(PhaseFailure::Cancelled);
                }

                let retryable = call_error.class().is_retryable() && attempt < max_attempts;
                if retryable {
                    let _ = inner.store.increment_retry(workflow_id);
                    let delay = backoff_delay(attempt, call_error.retry_after());
                    info!(
                        workflow_id,
                        phase = %phase,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient phase failure; backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PhaseFailure::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    continue;
                }

                if is_optional(phase) {
                    let skip_attempt = attempt + 1;
                    let record =
                        PhaseRecord::new(workflow_id, phase, index, skip_attempt, max_attempts);
                    let skipped = inner.store.insert_phase(&record).and_then(|()| {
                        inner.store.finish_phase(
                            workflow_id,
                            phase,
                            skip_attempt,
                            PhaseState::Skipped,
                            None,
                            Some("optional phase skipped after exhausted attempts"),
                        )
                    });
                    if let Err(e) = skipped {
                        warn!(workflow_id, phase = %phase, error = %e, "failed to record skip");
                    }
                    return Err(PhaseFailure::Skipped);
                }

                return Err(PhaseFailure::Fatal { message });
            }
        }
    }
}

/// Usage and output of one successful phase call (single or consensus).
#[derive(Default)]
struct PhaseUsage {
    text: String,
    provider: String,
    requests: u32,
    tokens_in: u64,
    tokens_out: u64,
    cost_usd: f64,
}

enum CallError {
    Provider(ProviderError),
    Consensus(ConsensusError),
}

impl CallError {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Cancelled { .. }) | Self::Consensus(ConsensusError::Cancelled)
        )
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::Provider(e) => e.class(),
            Self::Consensus(e) => e.class(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(e) => e.fmt(f),
            Self::Consensus(e) => e.fmt(f),
        }
    }
}

/// Route the phase and issue the provider call(s).
async fn call_providers(
    inner: &Arc<EngineInner>,
    workflow: &Workflow,
    phase: PhaseName,
    completed: &[PhaseName],
    cancel: &CancelToken,
) -> Result<PhaseUsage, CallError> {
    let key = RouteKey::new(phase, workflow.kind, workflow.model_set)
        .with_tags(workflow.tags.clone());
    let decision = inner.router.route(&key);
    let messages = build_messages(phase, workflow, completed);

    if decision.use_consensus {
        let group_name = decision.consensus.clone().unwrap_or_default();
        let group = inner
            .consensus_groups
            .get(&group_name)
            .ok_or_else(|| {
                CallError::Provider(ProviderError::Misconfigured {
                    provider: decision.provider.clone(),
                    reason: format!("unknown consensus group '{group_name}'"),
                })
            })?
            .clone();

        check_budget(inner, workflow, &decision, group.providers.len() as u32)
            .map_err(CallError::Provider)?;

        let requests: Vec<(String, ProviderRequest)> = group
            .providers
            .iter()
            .map(|provider| {
                let request = build_request(inner, provider, &decision, messages.clone());
                (provider.clone(), request)
            })
            .collect();
        let synthesizer = group.synthesizer.as_ref().map(|synth| SynthesizerSpec {
            provider: synth.provider.clone(),
            model: synth
                .model
                .clone()
                .unwrap_or_else(|| default_model(inner, &synth.provider)),
        });

        let consensus = ConsensusEngine::new(&inner.registry);
        let outcome = consensus
            .run(&group, requests, synthesizer, cancel.clone())
            .await
            .map_err(CallError::Consensus)?;
        Ok(PhaseUsage {
            text: outcome.response.text.clone(),
            provider: outcome.response.provider.clone(),
            requests: outcome.requests,
            tokens_in: outcome.total_tokens_in,
            tokens_out: outcome.total_tokens_out,
            cost_usd: outcome.total_cost_usd,
        })
    } else {
        check_budget(inner, workflow, &decision, 1).map_err(CallError::Provider)?;
        let request = build_request(inner, &decision.provider, &decision, messages);
        let call_timeout = request.timeout;
        let response = tokio::time::timeout(
            call_timeout,
            inner
                .registry
                .execute(&decision.provider, request, cancel.clone()),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout {
            provider: decision.provider.clone(),
            after: call_timeout,
        }))
        .map_err(CallError::Provider)?;
        Ok(PhaseUsage {
            text: response.text,
            provider: response.provider,
            requests: 1,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            cost_usd: response.cost_usd,
        })
    }
}

fn default_model(inner: &EngineInner, provider: &str) -> String {
    inner
        .provider_configs
        .get(provider)
        .map(|config| config.default_model.clone())
        .unwrap_or_else(|| "default".to_string())
}

fn build_request(
    inner: &EngineInner,
    provider: &str,
    decision: &RoutingDecision,
    messages: Vec<devflow_llm::Message>,
) -> ProviderRequest {
    // A decision's explicit model only applies to the decision's provider;
    // consensus participants use their own configured defaults.
    let model = if provider == decision.provider {
        decision
            .model
            .clone()
            .unwrap_or_else(|| default_model(inner, provider))
    } else {
        default_model(inner, provider)
    };
    let timeout = inner
        .provider_configs
        .get(provider)
        .and_then(|config| config.timeout_seconds)
        .map_or(inner.options.provider_call_timeout, Duration::from_secs);
    let mut request = ProviderRequest::new(model, messages).with_timeout(timeout);
    if let Some(max_tokens) = decision.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = decision.temperature {
        request = request.with_temperature(temperature);
    }
    request
}

/// Refuse the call when its projected cost would cross the budget.
fn check_budget(
    inner: &EngineInner,
    workflow: &Workflow,
    decision: &RoutingDecision,
    calls: u32,
) -> Result<(), ProviderError> {
    let Some(budget) = workflow.budget_usd else {
        return Ok(());
    };
    let projected_one = match inner.registry.get(&decision.provider) {
        Ok(client) => {
            let model = decision
                .model
                .clone()
                .unwrap_or_else(|| default_model(inner, &decision.provider));
            let estimated_out = u64::from(decision.max_tokens.unwrap_or(1024));
            client.cost_estimate(2048, estimated_out, &model)
        }
        Err(_) => 0.0,
    };
    inner.tracker.check_budget(
        &workflow.id,
        Some(budget),
        projected_one * f64::from(calls),
    )
}

fn apply_usage(
    inner: &EngineInner,
    workflow: &Workflow,
    phase: PhaseName,
    attempt: u32,
    usage: &PhaseUsage,
) {
    if let Err(e) = inner.store.add_phase_usage(
        &workflow.id,
        phase,
        attempt,
        usage.requests,
        usage.tokens_in,
        usage.tokens_out,
        usage.cost_usd,
    ) {
        warn!(workflow_id = %workflow.id, error = %e, "failed to persist phase usage");
    }
    if let Err(e) = inner.store.add_workflow_usage(
        &workflow.id,
        usage.cost_usd,
        usage.tokens_in + usage.tokens_out,
    ) {
        warn!(workflow_id = %workflow.id, error = %e, "failed to persist workflow usage");
    }
    let recorded = inner.tracker.record(
        &workflow.id,
        &usage.provider,
        usage.tokens_in,
        usage.tokens_out,
        usage.cost_usd,
        workflow.budget_usd,
    );
    if recorded.crossed_warning {
        inner.emit(
            Event::new(&workflow.id, EventType::ErrorOccurred)
                .with_severity(Severity::Warn)
                .with_message(format!(
                    "budget warning: ${:.4} of ${:.4} spent",
                    recorded.total_cost_usd,
                    workflow.budget_usd.unwrap_or_default()
                )),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_failed(
    inner: &EngineInner,
    workflow_id: &str,
    phase: PhaseName,
    attempt: u32,
    index: u32,
    max_attempts: u32,
    message: &str,
    usage: &PhaseUsage,
) {
    let _ = inner.store.finish_phase(
        workflow_id,
        phase,
        attempt,
        PhaseState::Failed,
        Some(1),
        Some(message),
    );
    let _ = inner.store.touch_activity(workflow_id);
    inner.emit(
        Event::new(workflow_id, EventType::PhaseFailed)
            .with_phase(phase)
            .with_severity(Severity::Error)
            .with_message(message)
            .with_metadata(json!({
                "attempt": attempt,
                "index": index,
                "max_attempts": max_attempts,
                "exit_code": 1,
                "requests": usage.requests,
                "tokens_in": usage.tokens_in,
                "tokens_out": usage.tokens_out,
                "cost_usd": usage.cost_usd,
            })),
    );
}

/// Next attempt number for a phase: one past the highest recorded attempt.
fn next_attempt(inner: &EngineInner, workflow_id: &str, phase: PhaseName) -> u32 {
    inner
        .store
        .list_phases(workflow_id)
        .ok()
        .and_then(|phases| {
            phases
                .iter()
                .filter(|p| p.name == phase)
                .map(|p| p.attempt)
                .max()
        })
        .map_or(1, |highest| highest + 1)
}

/// Full-jitter exponential backoff: base 1s, factor 2, cap 60s. A rate
/// limit's `retry_after` hint, when present, is the floor.
fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let ceiling = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    let delay = Duration::from_millis(jittered);
    match retry_after {
        Some(hint) if hint > delay => hint.min(BACKOFF_CAP),
        _ => delay,
    }
}
