//! Shared harness for engine scenario tests.
#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use stepwise_core::event::EventBus;
use stepwise_core::repository::{DefinitionStore, InMemoryStore};
use stepwise_core::workflow::actor::DeclaredApprovers;
use stepwise_core::workflow::definition::parse_definition_yaml;
use stepwise_core::workflow::handler::{ActionError, ActionHandler, ActionHandlerRegistry};
use stepwise_core::workflow::notify::{Notification, NotificationDispatcher};
use stepwise_core::workflow::orchestrator::InstanceOrchestrator;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::instance::{EntityRef, WorkflowInstance};
use stepwise_types::workflow::WorkflowDefinition;
use tokio::sync::broadcast;

pub type Orchestrator = InstanceOrchestrator<InMemoryStore, InMemoryStore, InMemoryStore>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Returns its params as output.
pub struct Record;

impl ActionHandler for Record {
    fn name(&self) -> &str {
        "record"
    }

    async fn invoke(&self, params: &Value, _context: &Map<String, Value>) -> Result<Value, ActionError> {
        Ok(params.clone())
    }
}

/// Always fails with a retryable error and counts its calls.
#[derive(Clone, Default)]
pub struct Failing {
    pub calls: Arc<AtomicUsize>,
}

impl ActionHandler for Failing {
    fn name(&self) -> &str {
        "fail"
    }

    async fn invoke(&self, _params: &Value, _context: &Map<String, Value>) -> Result<Value, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ActionError::Failed("boom".to_string()))
    }
}

/// Sleeps for `params.ms` milliseconds, then succeeds.
pub struct Slow;

impl ActionHandler for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn invoke(&self, params: &Value, _context: &Map<String, Value>) -> Result<Value, ActionError> {
        let ms = params["ms"].as_u64().unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

pub struct NullNotifier;

impl NotificationDispatcher for NullNotifier {
    fn dispatch<'a>(
        &'a self,
        _notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: InMemoryStore,
    pub orchestrator: Arc<Orchestrator>,
    pub failing: Failing,
    pub config: EngineConfig,
    events: broadcast::Receiver<WorkflowEvent>,
}

/// Engine config with immediate retries.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = InMemoryStore::new();
        let bus = EventBus::new(256);
        let events = bus.subscribe();
        let failing = Failing::default();
        let handlers = ActionHandlerRegistry::new()
            .with(Record)
            .with(Slow)
            .with(failing.clone());

        let orchestrator = Arc::new(InstanceOrchestrator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(DeclaredApprovers),
            handlers,
            Arc::new(NullNotifier),
            Arc::new(bus),
            &config,
        ));

        Self {
            store,
            orchestrator,
            failing,
            config,
            events,
        }
    }

    pub async fn deploy(&self, yaml: &str) -> WorkflowDefinition {
        let def = parse_definition_yaml(yaml).expect("definition should be valid");
        self.store.activate(def).await.unwrap()
    }

    pub async fn start(&self, code: &str, context: Value) -> WorkflowInstance {
        let context = match context {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.orchestrator
            .start_instance(
                code,
                "",
                EntityRef {
                    entity_type: "purchase_order".to_string(),
                    entity_id: "PO-1".to_string(),
                },
                context,
            )
            .await
            .unwrap()
    }

    /// Events published since the last drain.
    pub fn drain_events(&mut self) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn count(events: &[WorkflowEvent], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type() == event_type).count()
}
