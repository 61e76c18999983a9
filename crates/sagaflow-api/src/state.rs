//! Application state wiring the engine together.
//!
//! AppState holds the concrete engine pieces used by both the CLI and the
//! REST API. The core is generic over its repository; AppState pins it to
//! the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sagaflow_core::event::bus::EventBus;
use sagaflow_core::workflow::action::ActionRegistry;
use sagaflow_core::workflow::authz::PermissionSet;
use sagaflow_core::workflow::engine::WorkflowEngine;
use sagaflow_core::workflow::orchestrator::{Orchestrator, OrchestratorSettings};
use sagaflow_core::workflow::query::ExecutionQuery;
use sagaflow_core::workflow::retry::{BackoffPolicy, RetryScheduler, WorkQueue};
use sagaflow_infra::actions::register_builtin_actions;
use sagaflow_infra::config::load_config;
use sagaflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use sagaflow_infra::sqlite::pool::{DatabasePool, database_url};
use sagaflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use sagaflow_types::config::SagaflowConfig;

pub type ConcreteOrchestrator = Orchestrator<SqliteWorkflowRepository>;
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;
pub type ConcreteQuery = ExecutionQuery<SqliteWorkflowRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub engine: Arc<ConcreteEngine>,
    pub query: Arc<ConcreteQuery>,
    pub config: Arc<SagaflowConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    /// Open the database under `data_dir`, load `config.toml`, and wire the
    /// engine. Workers are not started; see [`WorkflowEngine::start`].
    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        ensure_data_dir(&data_dir).await?;
        let config = load_config(&data_dir).await;

        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url).await?;
        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool));

        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry)?;

        let events = EventBus::new(config.engine.event_capacity);
        let scheduler = RetryScheduler::new(
            Arc::new(WorkQueue::new()),
            BackoffPolicy::from_config(&config.retry),
            events.clone(),
        );
        let authorizer = Arc::new(PermissionSet::new(config.authorization.granted.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repo),
            Arc::new(registry),
            authorizer,
            scheduler.clone(),
            events,
            OrchestratorSettings::from_config(&config.engine),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&orchestrator),
            config.engine.worker_count,
            Duration::from_millis(config.retry.busy_requeue_ms),
        ));
        let query = Arc::new(ExecutionQuery::new(repo, scheduler));

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            orchestrator,
            engine,
            query,
            config: Arc::new(config),
            data_dir,
        })
    }
}
