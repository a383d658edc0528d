//! # Completion Listener
//!
//! Turns scheduler state changes into job status changes.
//!
//! | Remote state | Job status                                   |
//! |--------------|----------------------------------------------|
//! | pending      | unchanged (`waiting`)                        |
//! | active       | `running`                                    |
//! | done         | `complete`, then advance                     |
//! | failed       | `error`, or `cancelled` for user cancels     |
//!
//! On a terminal state the listener waits (bounded) for the remote output,
//! appends it to the job log, removes it remotely, deletes the snapshot file
//! and releases the scheduler's record. A completion pushed by the scheduler
//! re-enqueues the job so a consumer advances it; one observed while polling
//! advances it directly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fault::{CancellationDetector, RemoteFault};
use super::scheduler::{ClusterScheduler, RemoteHandle, RemoteState};
use crate::error::Result;
use crate::messaging::JobMessage;
use crate::models::{Job, StatusFile};
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;
use crate::status::{StatusUpdate, UpdateOutcome};

/// How a state change reached the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPath {
    /// Pushed by the scheduler
    Callback,
    /// Observed while serving a poll or recovery request
    Inbound,
}

pub struct CompletionListener {
    context: Arc<PipelineContext>,
    scheduler: Arc<dyn ClusterScheduler>,
    detector: Arc<dyn CancellationDetector>,
    output_wait_timeout: Duration,
    output_poll_interval: Duration,
    attached: DashMap<String, Uuid>,
}

impl std::fmt::Debug for CompletionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionListener")
            .field("attached", &self.attached.len())
            .field("output_wait_timeout", &self.output_wait_timeout)
            .finish()
    }
}

impl CompletionListener {
    pub fn new(
        context: Arc<PipelineContext>,
        scheduler: Arc<dyn ClusterScheduler>,
        detector: Arc<dyn CancellationDetector>,
    ) -> Self {
        let engine = &context.config().cluster_engine;
        let output_wait_timeout = engine.output_wait_timeout();
        let output_poll_interval = engine.output_poll_interval();
        Self {
            context,
            scheduler,
            detector,
            output_wait_timeout,
            output_poll_interval,
            attached: DashMap::new(),
        }
    }

    /// Route callbacks for `uri` to `job_id`
    pub fn attach(&self, uri: &str, job_id: Uuid) {
        self.attached.insert(uri.to_string(), job_id);
    }

    pub fn detach(&self, uri: &str) {
        self.attached.remove(uri);
    }

    pub fn is_attached(&self, uri: &str) -> bool {
        self.attached.contains_key(uri)
    }

    /// Forward scheduler callbacks for attached jobs until shutdown
    pub fn spawn_callback_pump(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut callbacks = self.scheduler.callbacks();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = callbacks.recv() => received,
                };
                match received {
                    Ok(callback) => {
                        let Some(job_id) = self.attached.get(&callback.uri).map(|e| *e.value()) else {
                            continue;
                        };
                        let listener = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = listener.handle(job_id, callback.state, CompletionPath::Callback).await {
                                warn!(job_id = %job_id, error = %e, "Cluster callback handling failed");
                            }
                        });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Cluster callbacks dropped; status poll will catch up");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Cluster callback pump stopped");
        })
    }

    /// Apply one remote state to the job
    pub async fn handle(&self, job_id: Uuid, state: RemoteState, path: CompletionPath) -> Result<()> {
        let Some(file) = self.context.store().get_status_file(job_id).await? else {
            debug!(job_id = %job_id, "Callback for a job without a status file");
            return Ok(());
        };
        let mut job = file.restore_job()?;
        let uri = job.job_uri();
        if !matches!(
            file.status,
            JobStatus::Waiting | JobStatus::Running | JobStatus::Cancelling
        ) {
            debug!(job_id = %job_id, status = %file.status, "Remote state after job settled");
            self.detach(&uri);
            return Ok(());
        }

        match state {
            RemoteState::Pending => Ok(()),
            RemoteState::Active => {
                self.mark_running(&file, &mut job).await?;
                Ok(())
            }
            RemoteState::Done => self.on_done(file, job, path).await,
            RemoteState::Failed(fault) => self.on_failed(file, job, fault).await,
        }
    }

    async fn mark_running(&self, file: &StatusFile, job: &mut Job) -> Result<()> {
        if file.status != JobStatus::Waiting {
            return Ok(());
        }
        job.status = JobStatus::Running;
        let update = StatusUpdate::for_file(file)
            .status(JobStatus::Running)
            .host(self.context.host_name())
            .snapshot(job)?;
        if self.context.store().update_status_file(update).await?.is_applied() {
            info!(job_id = %job.guid(), "Cluster job running");
        }
        Ok(())
    }

    async fn on_done(&self, file: StatusFile, job: Job, path: CompletionPath) -> Result<()> {
        let runner = self.context.runner();
        let mut job = self.node_copy(job).await;
        let handle = self.scheduler.find(&job.job_uri()).await.ok().flatten();
        if let Some(handle) = &handle {
            self.collect_output(&mut job, handle).await;
        }

        if file.status == JobStatus::Cancelling {
            runner.confirm_cancel(&mut job).await?;
            self.cleanup(&job, handle.as_ref()).await;
            return Ok(());
        }
        self.mark_running(&file, &mut job).await?;

        job.status = JobStatus::Complete;
        job.info("Cluster job complete");
        let update = StatusUpdate::for_job(&job)
            .status(JobStatus::Complete)
            .host(self.context.host_name())
            .snapshot(&job)?;
        let outcome = self.context.store().update_status_file(update).await?;
        self.cleanup(&job, handle.as_ref()).await;

        match outcome {
            UpdateOutcome::Applied(file) => match path {
                CompletionPath::Callback => {
                    let message = JobMessage::for_job(&job, &file.location)?;
                    self.context.dispatcher().publish(message).await?;
                    debug!(job_id = %job.guid(), "Completed cluster job re-enqueued for advance");
                }
                CompletionPath::Inbound => {
                    runner.advance(&mut job).await?;
                }
            },
            UpdateOutcome::Stale(current) if current.status == JobStatus::Cancelling => {
                runner.confirm_cancel(&mut job).await?;
            }
            UpdateOutcome::Stale(_) | UpdateOutcome::NotFound => {
                debug!(job_id = %job.guid(), "Completion already recorded");
            }
        }
        Ok(())
    }

    async fn on_failed(&self, file: StatusFile, job: Job, fault: RemoteFault) -> Result<()> {
        let runner = self.context.runner();
        let mut job = self.node_copy(job).await;
        let handle = self.scheduler.find(&job.job_uri()).await.ok().flatten();
        if let Some(handle) = &handle {
            self.collect_output(&mut job, handle).await;
        }

        let cancelled = self.detector.is_user_cancellation(&fault);
        if cancelled && file.status != JobStatus::Cancelling {
            self.context
                .store()
                .update_status_file(StatusUpdate::for_file(&file).status(JobStatus::Cancelling))
                .await?;
        }
        if cancelled || file.status == JobStatus::Cancelling {
            runner.confirm_cancel(&mut job).await?;
        } else {
            let message = format!("Cluster job failed: {}", fault.describe());
            if fault.kind.is_infrastructure() {
                warn!(job_id = %job.guid(), kind = ?fault.kind, error = %message, "Cluster infrastructure failure ended job");
            } else {
                warn!(job_id = %job.guid(), kind = ?fault.kind, error = %message, "Cluster job failed");
            }
            runner.mark_error(&mut job, &message).await?;
        }
        self.cleanup(&job, handle.as_ref()).await;
        Ok(())
    }

    /// The node rewrites the snapshot with its log and business state when
    /// the task ends; prefer that copy while it still belongs to this task.
    async fn node_copy(&self, job: Job) -> Job {
        match Job::read_snapshot_file(&job.snapshot_path()).await {
            Ok(mut remote) if remote.guid() == job.guid() && remote.active_task_id() == job.active_task_id() => {
                remote.status = job.status;
                remote
            }
            Ok(_) => {
                warn!(job_id = %job.guid(), "Snapshot on disk belongs to another task");
                job
            }
            Err(e) => {
                debug!(job_id = %job.guid(), error = %e, "No node snapshot; using stored job");
                job
            }
        }
    }

    async fn collect_output(&self, job: &mut Job, handle: &RemoteHandle) {
        let deadline = Instant::now() + self.output_wait_timeout;
        loop {
            match self.scheduler.output_ready(handle).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!(uri = %handle.uri, error = %e, "Could not check cluster output");
                    return;
                }
            }
            if Instant::now() >= deadline {
                warn!(uri = %handle.uri, "Timed out waiting for cluster output");
                job.warn("Cluster output was not available");
                return;
            }
            tokio::time::sleep(self.output_poll_interval).await;
        }

        match self.scheduler.fetch_output(handle).await {
            Ok(output) => {
                job.append_output("stdout", &output.stdout);
                job.append_output("stderr", &output.stderr);
            }
            Err(e) => warn!(uri = %handle.uri, error = %e, "Could not fetch cluster output"),
        }
        if let Err(e) = self.scheduler.remove_output(handle).await {
            warn!(uri = %handle.uri, error = %e, "Could not remove cluster output");
        }
    }

    async fn cleanup(&self, job: &Job, handle: Option<&RemoteHandle>) {
        let snapshot = job.snapshot_path();
        match tokio::fs::remove_file(&snapshot).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %snapshot.display(), error = %e, "Could not delete job snapshot"),
        }
        if let Some(handle) = handle {
            if let Err(e) = self.scheduler.release(handle).await {
                warn!(uri = %handle.uri, error = %e, "Could not release cluster job");
            }
        }
        self.detach(&job.job_uri());
    }
}
