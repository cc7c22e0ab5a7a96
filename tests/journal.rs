//! The journal replay law: replaying `events.ndjson` from seq 0 rebuilds
//! the same workflow and phase rows, modulo monotonic timestamps.

use std::sync::Arc;

use async_trait::async_trait;
use devflow::{
    read_journal, replay_journal, BusOptions, CancelToken, Config, Event, EventBus, EventType,
    ProviderClient, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse, Severity,
    StateStore, WorkflowEngine, WorkflowKind, WorkflowSpec,
};

struct HappyProvider;

#[async_trait]
impl ProviderClient for HappyProvider {
    fn name(&self) -> &str {
        "p1"
    }

    fn models(&self) -> Vec<String> {
        vec!["mock-model".into()]
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        _cancel: CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            provider: "p1".into(),
            model: request.model,
            text: "ok".into(),
            tokens_in: 10,
            tokens_out: 20,
            cost_usd: 0.0003,
            latency_ms: 1,
            raw: serde_json::Value::Null,
        })
    }

    fn cost_estimate(&self, _tokens_in: u64, _tokens_out: u64, _model: &str) -> f64 {
        0.0
    }
}

#[tokio::test]
async fn replaying_the_journal_reconstructs_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("events/events.ndjson");

    let config = Config::from_toml_str(
        r#"
        [providers.p1]
        api_key_env = "K"
        default_model = "mock-model"

        [router]
        default = { provider = "p1" }
        "#,
    )
    .unwrap();

    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let bus = EventBus::new(BusOptions::default());
    bus.attach_journal(&journal_path).unwrap();
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(HappyProvider), None);
    let engine = WorkflowEngine::new(Arc::clone(&store), bus.clone(), registry, &config).unwrap();

    let id = engine
        .create(WorkflowSpec {
            name: "journalled".into(),
            kind: WorkflowKind::Standard,
            task: "replay me".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    engine.start(&id).unwrap();
    engine.wait_idle(&id).await;

    // Drain the dispatcher: once this blocking publish returns, every
    // earlier event has been journalled too.
    bus.publish_blocking(
        Event::new("wf-flush", EventType::ErrorOccurred)
            .with_severity(Severity::Info)
            .with_message("flush"),
    )
    .await
    .unwrap();

    let events = read_journal(&journal_path).unwrap();
    assert!(events.len() >= 11, "journal should carry the full history");

    let replayed = StateStore::open_in_memory().unwrap();
    let stats = replay_journal(&replayed, &events).unwrap();
    assert_eq!(stats.workflows_created, 1);

    let original = store.get_workflow(&id).unwrap();
    let rebuilt = replayed.get_workflow(&id).unwrap();
    assert_eq!(rebuilt.name, original.name);
    assert_eq!(rebuilt.kind, original.kind);
    assert_eq!(rebuilt.state, original.state);
    assert_eq!(rebuilt.exit_code, original.exit_code);
    assert_eq!(rebuilt.phase_count, original.phase_count);
    assert_eq!(rebuilt.total_tokens, original.total_tokens);
    assert!((rebuilt.cost_usd - original.cost_usd).abs() < 1e-9);

    let original_phases = store.list_phases(&id).unwrap();
    let rebuilt_phases = replayed.list_phases(&id).unwrap();
    assert_eq!(original_phases.len(), rebuilt_phases.len());
    for (a, b) in original_phases.iter().zip(rebuilt_phases.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.attempt, b.attempt);
        assert_eq!(a.state, b.state);
        assert_eq!(a.llm_tokens_in, b.llm_tokens_in);
        assert_eq!(a.llm_tokens_out, b.llm_tokens_out);
    }
}
