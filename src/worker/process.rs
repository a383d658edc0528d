//! # Worker Process
//!
//! Lifecycle of one worker: register engines, recover every served location,
//! then start consuming.
//!
//! ```text
//! WorkerProcess::builder(context)
//!   .with_cluster_scheduler(..)      optional
//!   .with_remote_engine(..)          optional, repeatable
//!   .start()
//!      ├── register remote engines (remote.servers, cluster, custom)
//!      ├── RecoveryCoordinator per served location
//!      ├── LocalExecutionEngine      (local.locations)
//!      └── RemoteEngineDispatcher    per remote engine
//! shutdown()
//!      ├── cancel consumers, wait for them (local grace period applies)
//!      └── drop remote engines
//! ```
//!
//! Remote submissions outlive the process; the next start re-attaches them
//! during recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engines::cluster::{
    CancellationDetector, ClusterExecutionEngine, ClusterScheduler, CompositeCancellationDetector,
    CredentialProvider,
};
use crate::engines::{LocalExecutionEngine, QueueRemoteEngine, RemoteEngineDispatcher, RemoteExecutionEngine};
use crate::error::{PipelineError, Result};
use crate::recovery::{RecoveryCoordinator, RecoveryReport};
use crate::service::PipelineContext;

/// Extra time on top of the local grace period before consumers are aborted
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

struct ClusterBackend {
    scheduler: Arc<dyn ClusterScheduler>,
    credentials: Arc<dyn CredentialProvider>,
    detector: Arc<dyn CancellationDetector>,
}

pub struct WorkerProcessBuilder {
    context: Arc<PipelineContext>,
    cluster: Option<ClusterBackend>,
    remote_engines: Vec<Arc<dyn RemoteExecutionEngine>>,
}

impl std::fmt::Debug for WorkerProcessBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcessBuilder")
            .field("context", &self.context)
            .field("cluster", &self.cluster.is_some())
            .field("remote_engines", &self.remote_engines.len())
            .finish()
    }
}

impl WorkerProcessBuilder {
    /// Scheduler and credentials for the configured cluster locations
    pub fn with_cluster_scheduler(
        mut self,
        scheduler: Arc<dyn ClusterScheduler>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        self.cluster = Some(ClusterBackend {
            scheduler,
            credentials,
            detector: Arc::new(CompositeCancellationDetector::default()),
        });
        self
    }

    pub fn with_cancellation_detector(mut self, detector: Arc<dyn CancellationDetector>) -> Self {
        if let Some(cluster) = &mut self.cluster {
            cluster.detector = detector;
        }
        self
    }

    /// Serve an engine-specific location with a custom engine
    pub fn with_remote_engine(mut self, engine: Arc<dyn RemoteExecutionEngine>) -> Self {
        self.remote_engines.push(engine);
        self
    }

    fn build_engines(&mut self) -> Result<Vec<Arc<dyn RemoteExecutionEngine>>> {
        let config = self.context.config();
        let mut engines: Vec<Arc<dyn RemoteExecutionEngine>> = Vec::new();
        for server in &config.remote.servers {
            engines.push(Arc::new(QueueRemoteEngine::new(
                Arc::clone(&self.context),
                &server.location,
            )));
        }
        if config.cluster_engine.enabled {
            let backend = self.cluster.as_ref().ok_or_else(|| {
                PipelineError::invalid_operation("cluster engine enabled without a cluster scheduler")
            })?;
            for settings in &config.cluster {
                engines.push(Arc::new(ClusterExecutionEngine::new(
                    Arc::clone(&self.context),
                    &settings.location,
                    Arc::clone(&backend.scheduler),
                    Arc::clone(&backend.credentials),
                    Arc::clone(&backend.detector),
                )));
            }
        }
        engines.append(&mut self.remote_engines);
        Ok(engines)
    }

    /// Recover, then start every consumer
    pub async fn start(mut self) -> Result<WorkerProcess> {
        let engines = self.build_engines()?;
        let context = self.context;
        for engine in &engines {
            context.register_remote_engine(Arc::clone(engine));
        }

        let mut locations = context.config().served_locations();
        for engine in &engines {
            if !locations.iter().any(|l| l == engine.location()) {
                locations.push(engine.location().to_string());
            }
        }

        let recovery = if context.config().recovery.enabled {
            let coordinator = RecoveryCoordinator::new(Arc::clone(&context));
            match coordinator.recover_locations(&locations).await {
                Ok(reports) => reports,
                Err(e) => {
                    context.clear_remote_engines();
                    return Err(e);
                }
            }
        } else {
            info!("Recovery disabled; skipping startup sweep");
            Vec::new()
        };

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        let local = if context.config().local.enabled {
            let engine = Arc::new(LocalExecutionEngine::new(
                Arc::clone(&context),
                context.config().local.locations.clone(),
            ));
            handles.push(Arc::clone(&engine).spawn(shutdown.clone()));
            Some(engine)
        } else {
            None
        };
        for engine in engines {
            let dispatcher = Arc::new(RemoteEngineDispatcher::new(Arc::clone(&context), engine));
            handles.extend(dispatcher.spawn(shutdown.clone()));
        }

        info!(
            host = %context.host_name(),
            locations = ?locations,
            consumers = handles.len(),
            "🚀 Worker process started"
        );
        Ok(WorkerProcess {
            context,
            shutdown,
            handles,
            local,
            recovery,
        })
    }
}

pub struct WorkerProcess {
    context: Arc<PipelineContext>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    local: Option<Arc<LocalExecutionEngine>>,
    recovery: Vec<RecoveryReport>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("host", &self.context.host_name())
            .field("consumers", &self.handles.len())
            .field("local", &self.local)
            .field("stopping", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerProcess {
    pub fn builder(context: Arc<PipelineContext>) -> WorkerProcessBuilder {
        WorkerProcessBuilder {
            context,
            cluster: None,
            remote_engines: Vec::new(),
        }
    }

    /// Start with configured engines only
    pub async fn start(context: Arc<PipelineContext>) -> Result<Self> {
        Self::builder(context).start().await
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Startup sweep results, one per served location
    pub fn recovery_reports(&self) -> &[RecoveryReport] {
        &self.recovery
    }

    pub fn local_engine(&self) -> Option<&Arc<LocalExecutionEngine>> {
        self.local.as_ref()
    }

    /// Stop consuming; tasks still running after the grace period are left
    /// to the next startup's recovery
    pub async fn shutdown(self) -> Result<()> {
        info!(host = %self.context.host_name(), "🛑 Worker process shutting down");
        self.shutdown.cancel();

        let deadline = self.context.config().local.shutdown_grace_period() + SHUTDOWN_SLACK;
        for handle in self.handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(error = %e, "Consumer task failed"),
                Err(_) => {
                    warn!("Consumer did not stop in time; aborting");
                    abort.abort();
                }
            }
        }
        self.context.clear_remote_engines();
        info!("Worker process stopped");
        Ok(())
    }
}

/// Resolve when the process receives Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
