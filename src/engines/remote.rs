//! # Remote Execution Engines
//!
//! Contract for engines that run tasks outside this process, and the
//! dispatcher that feeds them from the shared queue.
//!
//! ```text
//! queue (location) ──► RemoteEngineDispatcher ──► engine.submit_job
//!                             │
//!                             └── every poll interval ──► engine.update_status_for_jobs
//! ```
//!
//! Engines report progress through the status store; messages carrying a
//! `complete` job are advanced here rather than submitted again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::logging::log_engine_operation;
use crate::messaging::{JobMessage, Selector};
use crate::models::{Job, StatusFile};
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;

#[derive(Error, Debug)]
pub enum RemoteEngineError {
    #[error("Submission to {location} failed: {message}")]
    Submission { location: String, message: String },

    #[error("Remote engine {engine} is unavailable: {message}")]
    Unavailable { engine: String, message: String },
}

impl RemoteEngineError {
    pub fn submission(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Submission {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            engine: engine.into(),
            message: message.into(),
        }
    }
}

/// What recovery learned about a job from its remote engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRecovery {
    /// Still queued or running remotely; listener re-attached
    StillRunning,
    /// Finished remotely; its outcome was recorded
    Finished,
    /// The remote side does not know the job; requeue it
    Unknown,
}

#[async_trait]
pub trait RemoteExecutionEngine: Send + Sync + 'static {
    fn engine_type(&self) -> &'static str;

    /// Execution location this engine serves
    fn location(&self) -> &str;

    /// Hand the job's active task to the remote side. Must not block until
    /// the task finishes.
    async fn submit_job(&self, job: Job) -> Result<()>;

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>>;

    /// Ask the remote side to stop the job; `true` when the request was
    /// delivered. The final `cancelled` status arrives asynchronously.
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool>;

    /// Refresh the recorded status of in-flight jobs in one batch
    async fn update_status_for_jobs(&self, job_ids: &[Uuid]) -> Result<()>;

    async fn recover_job(&self, file: &StatusFile) -> Result<RemoteRecovery>;

    /// Engine-specific background work, such as callback listeners
    fn spawn_background(self: Arc<Self>, _shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Consumes one remote location's queue and drives its engine
pub struct RemoteEngineDispatcher {
    context: Arc<PipelineContext>,
    engine: Arc<dyn RemoteExecutionEngine>,
    poll_interval: Duration,
}

impl std::fmt::Debug for RemoteEngineDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEngineDispatcher")
            .field("engine", &self.engine.engine_type())
            .field("location", &self.engine.location())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl RemoteEngineDispatcher {
    pub fn new(context: Arc<PipelineContext>, engine: Arc<dyn RemoteExecutionEngine>) -> Self {
        let poll_interval = context.config().remote.poll_interval();
        Self {
            context,
            engine,
            poll_interval,
        }
    }

    pub fn engine(&self) -> &Arc<dyn RemoteExecutionEngine> {
        &self.engine
    }

    /// Start the consumer, the status poller and the engine's own background
    /// tasks
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Arc::clone(&self.engine).spawn_background(shutdown.clone());

        let consumer = Arc::clone(&self);
        let consumer_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            consumer.consume_loop(consumer_shutdown).await;
        }));

        let poller = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            poller.poll_loop(shutdown).await;
        }));
        handles
    }

    async fn consume_loop(&self, shutdown: CancellationToken) {
        let location = self.engine.location().to_string();
        let selector = Selector::location(&location);
        let wait = self.context.config().queue.receive_wait();
        info!(engine = self.engine.engine_type(), location = %location, "🚀 Remote dispatcher started");

        while !shutdown.is_cancelled() {
            match self.context.transport().receive(&selector, wait).await {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle_message(message).await {
                        error!(location = %location, error = %e, "Remote dispatch failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(location = %location, error = %e, "Queue receive failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.context.config().queue.poll_interval()) => {}
                    }
                }
            }
        }
        info!(location = %location, "Remote dispatcher stopped");
    }

    /// Submit, advance or settle one consumed message
    pub async fn handle_message(&self, message: JobMessage) -> Result<()> {
        let dispatcher = Arc::clone(self.context.dispatcher());
        dispatcher
            .consume_scope(self.dispatch(message))
            .await??;
        Ok(())
    }

    async fn dispatch(&self, message: JobMessage) -> Result<()> {
        let runner = self.context.runner();
        let mut job = match message.to_job() {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "Dropping unreadable message");
                return Ok(());
            }
        };
        let Some(current) = self.context.store().get_status_file(job.guid()).await? else {
            warn!(job_id = %job.guid(), "Dropping message for unknown job");
            return Ok(());
        };
        if current.active_task_id != job.active_task_id().to_string() {
            debug!(job_id = %job.guid(), "Stale message for an earlier task");
            return Ok(());
        }

        match current.status {
            JobStatus::Cancelling => {
                runner.confirm_cancel(&mut job).await?;
            }
            JobStatus::Complete => {
                job.status = JobStatus::Complete;
                runner.advance(&mut job).await?;
            }
            JobStatus::Waiting => {
                let job_id = job.guid();
                match self.engine.submit_job(job.clone()).await {
                    Ok(()) => log_engine_operation(
                        self.engine.engine_type(),
                        self.engine.location(),
                        "submit",
                        Some(job_id),
                        "submitted",
                        None,
                    ),
                    Err(e) => {
                        let message = format!("Failed to submit to {}: {e}", self.engine.location());
                        warn!(job_id = %job_id, error = %e, "Remote submission failed");
                        runner.mark_error(&mut job, &message).await?;
                    }
                }
            }
            other => debug!(job_id = %job.guid(), status = %other, "Message ignored in current status"),
        }
        Ok(())
    }

    async fn poll_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                warn!(location = %self.engine.location(), error = %e, "Remote status poll failed");
            }
        }
    }

    /// One batch status refresh of every in-flight job at this location
    pub async fn poll_once(&self) -> Result<usize> {
        let job_ids: Vec<Uuid> = self
            .context
            .store()
            .status_files_for_location(self.engine.location(), true)
            .await?
            .into_iter()
            .map(|file| file.job_id)
            .collect();
        if job_ids.is_empty() {
            return Ok(0);
        }
        debug!(location = %self.engine.location(), jobs = job_ids.len(), "Polling remote statuses");
        self.engine.update_status_for_jobs(&job_ids).await?;
        Ok(job_ids.len())
    }
}
