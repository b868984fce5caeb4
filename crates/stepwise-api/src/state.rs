//! Application state wiring the engine together.
//!
//! The engine types are generic over their repositories; AppState pins them
//! to the SQLite implementations and the built-in collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use stepwise_core::event::EventBus;
use stepwise_core::workflow::orchestrator::InstanceOrchestrator;
use stepwise_infra::config::load_engine_config;
use stepwise_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use stepwise_infra::sqlite::pool::database_url;
use stepwise_infra::sqlite::{
    DatabasePool, SqliteApprovalRepository, SqliteDefinitionStore, SqliteInstanceRepository,
};
use stepwise_infra::workflow::{ConfigActorResolver, TracingNotifier, builtin_handlers};
use stepwise_types::config::EngineConfig;

/// Orchestrator pinned to the SQLite stores.
pub type ConcreteOrchestrator =
    InstanceOrchestrator<SqliteDefinitionStore, SqliteInstanceRepository, SqliteApprovalRepository>;

/// Shared state for every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub events: EventBus,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load config, open the database and wire
    /// the orchestrator.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url).await?;

        let events = EventBus::new(config.event_capacity);
        let orchestrator = InstanceOrchestrator::new(
            SqliteDefinitionStore::new(db_pool.clone()),
            SqliteInstanceRepository::new(db_pool.clone()),
            SqliteApprovalRepository::new(db_pool),
            Arc::new(ConfigActorResolver::from_config(&config)),
            builtin_handlers()?,
            Arc::new(TracingNotifier),
            Arc::new(events.clone()),
            &config,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            events,
            config,
            data_dir,
        })
    }
}
