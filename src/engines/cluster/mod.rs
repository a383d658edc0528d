//! # Cluster Execution Engine
//!
//! Runs tasks as batch jobs on a cluster scheduler.
//!
//! ## Submission
//!
//! ```text
//! job ─► resolve settings (server, queue, limits)
//!     ─► write <log>.job.json
//!     ─► ClusterJobDescription (paths mapped to the node's view)
//!     ─► proxy credential
//!     ─► attach listener, submit as uuid:<guid>/<task>
//! ```
//!
//! The node runs `pipeline-worker run-job <snapshot>`; progress comes back as
//! scheduler callbacks handled by the [`CompletionListener`], with the
//! remote dispatcher's poll as a fallback.

pub mod credential;
pub mod description;
pub mod fault;
pub mod listener;
pub mod scheduler;
pub mod settings;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::remote::{RemoteExecutionEngine, RemoteRecovery};
use crate::config::{ClusterEngineConfig, ClusterSettings};
use crate::error::{PipelineError, Result};
use crate::logging::log_engine_operation;
use crate::models::{Job, StatusFile};
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;
use crate::status::StatusUpdate;

pub use credential::{CredentialProvider, ProxyCredential, StaticCredentialProvider};
pub use description::{ClusterJobDescription, PathMapper};
pub use fault::{
    CancellationDetector, CompositeCancellationDetector, FaultKind, MessageCancellationDetector,
    RemoteFault, StructuredCancellationDetector,
};
pub use listener::{CompletionListener, CompletionPath};
pub use scheduler::{
    ClusterOutput, ClusterScheduler, RemoteHandle, RemoteState, SchedulerCallback,
};
pub use settings::{resolve_cluster_settings, JobClusterOverrides, ResolvedClusterSettings};
pub use simulated::SimulatedClusterScheduler;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("No cluster settings configured")]
    NoSettings,

    #[error("Multiple cluster locations define queue {queue}")]
    AmbiguousQueue { queue: String },

    #[error("Could not find cluster settings for location {location}")]
    UnknownLocation { location: String },

    #[error("Invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    #[error("Credential error: {message}")]
    Credential { message: String },

    #[error("Remote fault: {0}")]
    Fault(RemoteFault),

    #[error("Scheduler {operation} failed: {message}")]
    Scheduler { operation: String, message: String },

    #[error("Scheduler does not know job {uri}")]
    UnknownJob { uri: String },
}

impl ClusterError {
    pub fn ambiguous_queue(queue: impl Into<String>) -> Self {
        Self::AmbiguousQueue {
            queue: queue.into(),
        }
    }

    pub fn unknown_location(location: impl Into<String>) -> Self {
        Self::UnknownLocation {
            location: location.into(),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    pub fn scheduler(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scheduler {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unknown_job(uri: impl Into<String>) -> Self {
        Self::UnknownJob { uri: uri.into() }
    }
}

pub struct ClusterExecutionEngine {
    location: String,
    settings: Vec<ClusterSettings>,
    engine_config: ClusterEngineConfig,
    mapper: PathMapper,
    context: Arc<PipelineContext>,
    scheduler: Arc<dyn ClusterScheduler>,
    credentials: Arc<dyn CredentialProvider>,
    listener: Arc<CompletionListener>,
}

impl std::fmt::Debug for ClusterExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterExecutionEngine")
            .field("location", &self.location)
            .field("servers", &self.settings.len())
            .field("listener", &self.listener)
            .finish()
    }
}

impl ClusterExecutionEngine {
    pub fn new(
        context: Arc<PipelineContext>,
        location: impl Into<String>,
        scheduler: Arc<dyn ClusterScheduler>,
        credentials: Arc<dyn CredentialProvider>,
        detector: Arc<dyn CancellationDetector>,
    ) -> Self {
        let settings = context.config().cluster.clone();
        let engine_config = context.config().cluster_engine.clone();
        let mapper = PathMapper::new(engine_config.path_mappings.clone());
        let listener = Arc::new(CompletionListener::new(
            Arc::clone(&context),
            Arc::clone(&scheduler),
            detector,
        ));
        Self {
            location: location.into(),
            settings,
            engine_config,
            mapper,
            context,
            scheduler,
            credentials,
            listener,
        }
    }

    pub fn listener(&self) -> &Arc<CompletionListener> {
        &self.listener
    }

    /// Settings this job would be submitted with
    pub fn resolve_for(&self, job: &Job) -> Result<ResolvedClusterSettings> {
        let factory = self.context.registry().factory(job.active_task_id())?;
        let mut overrides = factory.cluster_overrides();
        if overrides.location.is_none()
            && self
                .settings
                .iter()
                .any(|s| s.location.eq_ignore_ascii_case(&self.location))
        {
            overrides.location = Some(self.location.clone());
        }
        let job_overrides =
            JobClusterOverrides::from_parameters(&job.parameters, factory.group_parameter_name())?;
        Ok(resolve_cluster_settings(&self.settings, &overrides, &job_overrides)?)
    }

    async fn handle_for(&self, file: &StatusFile) -> Result<Option<(Job, RemoteHandle)>> {
        let job = file.restore_job()?;
        let handle = self.scheduler.find(&job.job_uri()).await?;
        Ok(handle.map(|handle| (job, handle)))
    }
}

#[async_trait]
impl RemoteExecutionEngine for ClusterExecutionEngine {
    fn engine_type(&self) -> &'static str {
        "cluster"
    }

    fn location(&self) -> &str {
        &self.location
    }

    #[instrument(skip(self, job), fields(job_id = %job.guid(), task_id = %job.active_task_id()))]
    async fn submit_job(&self, job: Job) -> Result<()> {
        let resolved = self.resolve_for(&job)?;
        let snapshot = job.write_snapshot_file().await?;
        let description = ClusterJobDescription::build(
            &self.engine_config,
            &resolved,
            &job,
            &snapshot,
            &self.mapper,
            Utc::now(),
        );
        let uri = job.job_uri();

        let submitted = match self.credentials.credential(&resolved.location).await {
            Ok(credential) => {
                self.listener.attach(&uri, job.guid());
                self.scheduler.submit(&uri, &description, &credential).await
            }
            Err(e) => Err(e),
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                self.listener.detach(&uri);
                if let Err(io) = tokio::fs::remove_file(&snapshot).await {
                    debug!(error = %io, "Snapshot cleanup after failed submit");
                }
                return Err(e.into());
            }
        };

        let claim = StatusUpdate::for_job(&job).host(self.context.host_name());
        self.context.store().update_status_file(claim).await?;
        log_engine_operation(
            self.engine_type(),
            &resolved.location,
            "submit",
            Some(job.guid()),
            "submitted",
            Some(&format!(
                "uri={uri} remote_id={} queue={}",
                handle.remote_id,
                resolved.queue.as_deref().unwrap_or("-")
            )),
        );
        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        Ok(self
            .context
            .store()
            .get_status_file(job_id)
            .await?
            .map(|file| file.status))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let file = self
            .context
            .store()
            .get_status_file(job_id)
            .await?
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;
        match self.handle_for(&file).await? {
            Some((_, handle)) => {
                self.scheduler.cancel(&handle).await?;
                log_engine_operation(self.engine_type(), &self.location, "cancel", Some(job_id), "requested", None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_status_for_jobs(&self, job_ids: &[Uuid]) -> Result<()> {
        for &job_id in job_ids {
            let Some(file) = self.context.store().get_status_file(job_id).await? else {
                continue;
            };
            if !file.status.is_active() {
                continue;
            }
            let (_, handle) = match self.handle_for(&file).await {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Cluster status lookup failed");
                    continue;
                }
            };
            let state = match self.scheduler.refresh_status(&handle).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Cluster status refresh failed");
                    continue;
                }
            };
            let unchanged = matches!(
                (&state, file.status),
                (RemoteState::Pending, JobStatus::Waiting) | (RemoteState::Active, JobStatus::Running)
            );
            if !unchanged {
                self.listener
                    .handle(job_id, state, CompletionPath::Inbound)
                    .await?;
            }
        }
        Ok(())
    }

    async fn recover_job(&self, file: &StatusFile) -> Result<RemoteRecovery> {
        let Some((job, handle)) = self.handle_for(file).await? else {
            return Ok(RemoteRecovery::Unknown);
        };
        let state = self.scheduler.refresh_status(&handle).await?;
        if state.is_terminal() {
            self.listener
                .handle(file.job_id, state, CompletionPath::Inbound)
                .await?;
            return Ok(RemoteRecovery::Finished);
        }
        self.listener.attach(&job.job_uri(), file.job_id);
        if state == RemoteState::Active {
            self.listener
                .handle(file.job_id, state, CompletionPath::Inbound)
                .await?;
        }
        Ok(RemoteRecovery::StillRunning)
    }

    fn spawn_background(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![Arc::clone(&self.listener).spawn_callback_pump(shutdown)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::models::TaskId;
    use crate::pipeline::{
        FnTaskFactory, ResourceOverrides, Task, TaskContext, TaskError, TaskFactory, TaskRegistry,
    };
    use async_trait::async_trait;

    struct Never;

    #[async_trait]
    impl Task for Never {
        async fn run(&self, _job: &mut Job, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            Err(TaskError::failed("runs on the cluster"))
        }
    }

    struct Fixture {
        context: Arc<PipelineContext>,
        scheduler: Arc<SimulatedClusterScheduler>,
        engine: ClusterExecutionEngine,
        _dir: tempfile::TempDir,
        job: Job,
    }

    fn convert_stage() -> FnTaskFactory {
        FnTaskFactory::new(TaskId::new("import", "convert"), "cluster1", |_| {
            Ok(Box::new(Never) as Box<dyn Task>)
        })
    }

    async fn fixture() -> Fixture {
        fixture_with(SimulatedClusterScheduler::new(), convert_stage()).await
    }

    async fn fixture_with(scheduler: SimulatedClusterScheduler, convert: FnTaskFactory) -> Fixture {
        let mut config = PipelineConfig::default();
        config.cluster = vec![ClusterSettings {
            location: "cluster1".into(),
            endpoint: "https://cluster1:8443".into(),
            available_queues: vec!["short".into(), "long".into()],
            ..ClusterSettings::default()
        }];
        config.cluster_engine.output_wait_timeout_ms = 50;
        config.cluster_engine.output_poll_interval_ms = 10;

        let registry = Arc::new(TaskRegistry::new());
        let convert: Arc<dyn TaskFactory> = Arc::new(convert);
        registry.register_pipeline("import", vec![convert]).unwrap();
        let context = Arc::new(PipelineContext::in_memory(config, registry).unwrap());

        let scheduler = Arc::new(scheduler);
        let engine = ClusterExecutionEngine::new(
            Arc::clone(&context),
            "cluster1",
            scheduler.clone(),
            Arc::new(StaticCredentialProvider::new(ProxyCredential::new("CN=test", "t"))),
            Arc::new(CompositeCancellationDetector::default()),
        );

        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(
            TaskId::new("import", "convert"),
            "/c",
            "d",
            dir.path().join("run1.log"),
        );
        context
            .store()
            .insert_or_replace(StatusFile::for_job(&job, "cluster1").unwrap())
            .await
            .unwrap();
        Fixture { context, scheduler, engine, _dir: dir, job }
    }

    #[tokio::test]
    async fn test_submit_writes_snapshot_and_description() {
        let f = fixture().await;
        f.engine.submit_job(f.job.clone()).await.unwrap();

        assert!(f.job.snapshot_path().exists());
        let description = f.scheduler.description(&f.job.job_uri()).unwrap();
        assert_eq!(description.queue.as_deref(), Some("short"));
        assert_eq!(description.endpoint, "https://cluster1:8443");
        assert!(f.engine.listener().is_attached(&f.job.job_uri()));
    }

    #[tokio::test]
    async fn test_done_on_poll_finishes_job() {
        let f = fixture().await;
        f.engine.submit_job(f.job.clone()).await.unwrap();
        f.scheduler.set_output(&f.job.job_uri(), "converted 10 rows", "");
        f.scheduler.set_state(&f.job.job_uri(), RemoteState::Done);

        f.engine.update_status_for_jobs(&[f.job.guid()]).await.unwrap();

        let file = f.context.store().get_status_file(f.job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Complete);
        assert!(file.active_host_name.is_none());
        let stored = file.restore_job().unwrap();
        assert!(stored
            .log_entries()
            .iter()
            .any(|entry| entry.message.contains("converted 10 rows")));
        assert!(!f.job.snapshot_path().exists());
        assert_eq!(f.scheduler.submitted(), 0);
    }

    #[tokio::test]
    async fn test_stage_group_parameters_override_resources() {
        let stage = convert_stage().with_group("XTandem").with_overrides(ResourceOverrides {
            max_memory_mb: Some(4096),
            max_wall_time_minutes: Some(30),
            ..ResourceOverrides::default()
        });
        let f = fixture_with(SimulatedClusterScheduler::new(), stage).await;
        let job = f
            .job
            .clone()
            .with_parameter("XTandem, cluster queue", "long")
            .with_parameter("XTandem, cluster max wall time", "90");

        let resolved = f.engine.resolve_for(&job).unwrap();
        assert_eq!(resolved.location, "cluster1");
        assert_eq!(resolved.queue.as_deref(), Some("long"));
        assert_eq!(resolved.max_memory_mb, Some(4096));
        assert_eq!(resolved.max_wall_time_minutes, Some(90));

        let ungrouped = f.engine.resolve_for(&f.job).unwrap();
        assert_eq!(ungrouped.queue.as_deref(), Some("short"));
        assert_eq!(ungrouped.max_wall_time_minutes, Some(30));
    }

    #[tokio::test]
    async fn test_missing_output_is_noted_in_log() {
        let f = fixture_with(SimulatedClusterScheduler::new().with_manual_output(), convert_stage()).await;
        f.engine.submit_job(f.job.clone()).await.unwrap();
        f.scheduler.set_state(&f.job.job_uri(), RemoteState::Done);

        f.engine.update_status_for_jobs(&[f.job.guid()]).await.unwrap();

        let file = f.context.store().get_status_file(f.job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Complete);
        let stored = file.restore_job().unwrap();
        assert!(stored
            .log_entries()
            .iter()
            .any(|entry| entry.message == "Cluster output was not available"));
    }

    #[tokio::test]
    async fn test_failure_becomes_error_with_message() {
        let f = fixture().await;
        f.engine.submit_job(f.job.clone()).await.unwrap();
        f.scheduler.set_state(
            &f.job.job_uri(),
            RemoteState::Failed(RemoteFault::new(FaultKind::Execution, "exit code 137")),
        );
        f.engine.update_status_for_jobs(&[f.job.guid()]).await.unwrap();

        let file = f.context.store().get_status_file(f.job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Error);
        assert_eq!(file.info.as_deref(), Some("Cluster job failed: exit code 137"));
    }

    #[tokio::test]
    async fn test_submit_failure_is_reported() {
        let f = fixture().await;
        f.scheduler
            .fail_next_submit(RemoteFault::new(FaultKind::Submission, "queue closed"));
        let err = f.engine.submit_job(f.job.clone()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cluster(ClusterError::Fault(_))));
        assert!(!f.engine.listener().is_attached(&f.job.job_uri()));
        assert!(!f.job.snapshot_path().exists());
    }

    #[tokio::test]
    async fn test_recover_reattaches_running_job() {
        let f = fixture().await;
        f.engine.submit_job(f.job.clone()).await.unwrap();
        f.engine.listener().detach(&f.job.job_uri());
        f.scheduler.set_state(&f.job.job_uri(), RemoteState::Active);

        let file = f.context.store().get_status_file(f.job.guid()).await.unwrap().unwrap();
        assert_eq!(
            f.engine.recover_job(&file).await.unwrap(),
            RemoteRecovery::StillRunning
        );
        assert!(f.engine.listener().is_attached(&f.job.job_uri()));
        assert_eq!(
            f.engine.get_status(f.job.guid()).await.unwrap(),
            Some(JobStatus::Running)
        );
    }
}
