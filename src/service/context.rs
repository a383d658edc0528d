//! # Pipeline Context
//!
//! Shared dependencies of one worker process, passed explicitly to every
//! component instead of living in globals.
//!
//! ```text
//! PipelineContext
//!   ├── PipelineConfig
//!   ├── Arc<dyn StatusStore>        (in-memory | PostgreSQL)
//!   ├── Arc<dyn QueueTransport>     (in-memory | PostgreSQL)
//!   ├── Arc<QueueDispatcher>
//!   ├── Arc<TaskRegistry>
//!   ├── Arc<CancellationRegistry>
//!   ├── Arc<dyn LocationLock>
//!   ├── Arc<JobRunner>
//!   ├── QueuePositionCache
//!   └── remote engines by location
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::cancellation::CancellationRegistry;
use crate::config::{Backend, ConfigManager, PipelineConfig};
use crate::engines::RemoteExecutionEngine;
use crate::error::Result;
use crate::messaging::{InMemoryQueueTransport, PgQueueTransport, QueueDispatcher, QueueTransport};
use crate::pipeline::{JobRunner, TaskRegistry};
use crate::status::{
    InMemoryLocationLock, InMemoryStatusStore, LocationLock, PgLocationLock, PgStatusStore,
    QueuePositionCache, StatusStore,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PipelineContext {
    config: PipelineConfig,
    host_name: String,
    store: Arc<dyn StatusStore>,
    transport: Arc<dyn QueueTransport>,
    dispatcher: Arc<QueueDispatcher>,
    registry: Arc<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
    location_lock: Arc<dyn LocationLock>,
    runner: Arc<JobRunner>,
    queue_positions: QueuePositionCache,
    remote_engines: DashMap<String, Arc<dyn RemoteExecutionEngine>>,
    pool: Option<PgPool>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("host_name", &self.host_name)
            .field("store", &self.store.provider_name())
            .field("transport", &self.transport.provider_name())
            .field("registry", &self.registry)
            .field("remote_engines", &self.remote_engine_locations())
            .field(
                "pool",
                &self.pool.as_ref().map(|pool| format!("PgPool(size={})", pool.size())),
            )
            .finish()
    }
}

impl PipelineContext {
    /// Assemble a context from already-built backends
    pub fn from_parts(
        config: PipelineConfig,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StatusStore>,
        transport: Arc<dyn QueueTransport>,
        location_lock: Arc<dyn LocationLock>,
    ) -> Self {
        let host_name = config.host_name();
        let dispatcher = Arc::new(QueueDispatcher::new(Arc::clone(&transport)));
        let cancellations = Arc::new(CancellationRegistry::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&cancellations),
            host_name.clone(),
        ));
        let queue_positions = QueuePositionCache::new(config.status_store.queue_position_ttl());
        Self {
            config,
            host_name,
            store,
            transport,
            dispatcher,
            registry,
            cancellations,
            location_lock,
            runner,
            queue_positions,
            remote_engines: DashMap::new(),
            pool: None,
        }
    }

    /// Context backed entirely by in-process state
    pub fn in_memory(config: PipelineConfig, registry: Arc<TaskRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config,
            registry,
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(InMemoryQueueTransport::new()),
            Arc::new(InMemoryLocationLock::new()),
        ))
    }

    /// Context for the configured backends, connecting to PostgreSQL and
    /// running migrations when either backend needs it
    pub async fn connect(manager: &ConfigManager, registry: Arc<TaskRegistry>) -> Result<Self> {
        let config = manager.config().clone();
        config.validate()?;
        if !config.uses_postgres() {
            info!(environment = %manager.environment(), "🔧 Pipeline context using in-memory backends");
            return Self::in_memory(config, registry);
        }

        let database_url = config.database_url();
        info!(
            environment = %manager.environment(),
            database = %database_url.chars().take(30).collect::<String>(),
            "🔧 Connecting pipeline context to PostgreSQL"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&database_url)
            .await?;
        if config.database.run_migrations {
            MIGRATOR.run(&pool).await?;
            info!("✅ Pipeline migrations applied");
        }
        Ok(Self::with_pool(config, registry, pool))
    }

    /// Context over an existing pool; backends follow the configured choice
    pub fn with_pool(config: PipelineConfig, registry: Arc<TaskRegistry>, pool: PgPool) -> Self {
        let store: Arc<dyn StatusStore> = match config.status_store.backend {
            Backend::Postgres => Arc::new(PgStatusStore::new(pool.clone())),
            Backend::InMemory => Arc::new(InMemoryStatusStore::new()),
        };
        let transport: Arc<dyn QueueTransport> = match config.queue.backend {
            Backend::Postgres => Arc::new(PgQueueTransport::new(
                pool.clone(),
                config.queue.poll_interval(),
            )),
            Backend::InMemory => Arc::new(InMemoryQueueTransport::new()),
        };
        let location_lock: Arc<dyn LocationLock> = Arc::new(PgLocationLock::new(pool.clone()));
        let mut context = Self::from_parts(config, registry, store, transport, location_lock);
        context.pool = Some(pool);
        context
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<QueueDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn location_lock(&self) -> &Arc<dyn LocationLock> {
        &self.location_lock
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn queue_positions(&self) -> &QueuePositionCache {
        &self.queue_positions
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Route a location's cancels and recovery through `engine`
    pub fn register_remote_engine(&self, engine: Arc<dyn RemoteExecutionEngine>) {
        self.remote_engines
            .insert(engine.location().to_string(), engine);
    }

    pub fn remote_engine(&self, location: &str) -> Option<Arc<dyn RemoteExecutionEngine>> {
        self.remote_engines
            .get(location)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remote_engine_locations(&self) -> Vec<String> {
        let mut locations: Vec<String> =
            self.remote_engines.iter().map(|e| e.key().clone()).collect();
        locations.sort();
        locations
    }

    /// Drop every registered engine; engines hold the context, so this
    /// breaks the reference cycle on shutdown
    pub fn clear_remote_engines(&self) {
        self.remote_engines.clear();
    }
}
