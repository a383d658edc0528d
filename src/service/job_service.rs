//! # Job Service
//!
//! The API business code uses to hand jobs to the pipeline and manage them
//! afterwards.
//!
//! ## Cancellation
//!
//! ```text
//! cancel(job)
//!   1. status -> cancelling              (stale: job already settled, false)
//!   2. remove_if_present(job) on queue   -> cancelled immediately
//!   3. else remote engine owns location  -> fire-and-forget cancel_job
//!   4. else running here                 -> fire the task's token
//!      (running elsewhere: that worker's heartbeat sees `cancelling`)
//! ```
//!
//! Queue removal and consumption are mutually exclusive on the transport, so
//! a job is either pulled before it starts or stopped by its running worker,
//! never both.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::logging::log_job_operation;
use crate::messaging::JobMessage;
use crate::models::{Job, StatusFile};
use crate::pipeline::AdvanceOutcome;
use crate::state_machine::JobStatus;
use crate::status::{StatusUpdate, UpdateOutcome};

#[derive(Debug, Clone)]
pub struct JobService {
    context: Arc<PipelineContext>,
}

impl JobService {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Record the job and queue its active task at that task's location
    #[instrument(skip(self, job), fields(job_id = %job.guid(), task_id = %job.active_task_id()))]
    pub async fn submit(&self, mut job: Job) -> Result<StatusFile> {
        let location = self.context.registry().location_for(job.active_task_id())?;
        job.status = JobStatus::Waiting;
        let file = StatusFile::for_job(&job, &location)?;
        self.context.store().insert_or_replace(file.clone()).await?;
        self.enqueue(&job, &location).await?;
        log_job_operation(
            "submit",
            Some(job.guid()),
            Some(&job.active_task_id().to_string()),
            "waiting",
            Some(&location),
        );
        Ok(file)
    }

    /// Publish, leaving the job `error` when the transport refuses it
    async fn enqueue(&self, job: &Job, location: &str) -> Result<()> {
        let published = match JobMessage::for_job(job, location) {
            Ok(message) => self.context.dispatcher().publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            let message = format!("Failed to queue job at {location}: {e}");
            warn!(job_id = %job.guid(), error = %e, "Job could not be queued");
            let update = StatusUpdate::for_job(job)
                .status(JobStatus::Error)
                .clear_host()
                .info(&message)
                .forced();
            self.context.store().update_status_file(update).await?;
            return Err(PipelineError::Messaging(e));
        }
        Ok(())
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<StatusFile>> {
        self.context.store().get_status_file(job_id).await
    }

    pub async fn get_status_by_path(&self, path: &str) -> Result<Option<StatusFile>> {
        self.context.store().get_status_file_by_path(path).await
    }

    /// 1-based positions of the jobs queued at `location`
    pub async fn queue_positions(&self, location: &str) -> Result<Arc<HashMap<Uuid, usize>>> {
        Ok(self
            .context
            .queue_positions()
            .positions(location, self.context.transport().as_ref())
            .await?)
    }

    /// Position of a waiting job in its location's queue
    pub async fn queue_position(&self, job_id: Uuid) -> Result<Option<usize>> {
        let Some(file) = self.get_status(job_id).await? else {
            return Ok(None);
        };
        if file.status != JobStatus::Waiting {
            return Ok(None);
        }
        Ok(self.queue_positions(&file.location).await?.get(&job_id).copied())
    }

    /// Request cancellation; `true` when the request took effect
    #[instrument(skip(self, status_file), fields(job_id = %status_file.job_id))]
    pub async fn cancel(&self, user: &str, container: &str, status_file: &StatusFile) -> Result<bool> {
        if status_file.container != container {
            return Err(PipelineError::invalid_operation(format!(
                "Job {} does not belong to {container}",
                status_file.job_id
            )));
        }
        let job_id = status_file.job_id;
        let Some(current) = self.get_status(job_id).await? else {
            return Err(PipelineError::job_not_found(job_id));
        };
        if current.status.is_terminal() {
            debug!(status = %current.status, "Cancel for a settled job ignored");
            return Ok(false);
        }

        let request = StatusUpdate::for_file(&current)
            .status(JobStatus::Cancelling)
            .info(format!("Cancellation requested by {user}"));
        let marked = match self.context.store().update_status_file(request).await? {
            UpdateOutcome::Applied(file) => file,
            UpdateOutcome::Stale(file) => {
                debug!(status = %file.status, "Job moved on before cancel");
                return Ok(false);
            }
            UpdateOutcome::NotFound => return Err(PipelineError::job_not_found(job_id)),
        };
        log_job_operation("cancel", Some(job_id), Some(&marked.active_task_id), "cancelling", Some(user));

        if self.context.transport().remove_if_present(job_id).await? {
            let done = StatusUpdate::for_file(&marked)
                .status(JobStatus::Cancelled)
                .clear_host()
                .info("Cancelled before start");
            self.context.store().update_status_file(done).await?;
            info!(job_id = %job_id, "🛑 Job removed from queue and cancelled");
            return Ok(true);
        }

        if let Some(engine) = self.context.remote_engine(&marked.location) {
            tokio::spawn(async move {
                match engine.cancel_job(job_id).await {
                    Ok(delivered) => debug!(job_id = %job_id, delivered, "Remote cancel requested"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "Remote cancel failed"),
                }
            });
            return Ok(true);
        }

        if self.context.cancellations().cancel(job_id) {
            debug!(job_id = %job_id, "Cancellation signalled to running task");
        }
        Ok(true)
    }

    /// Restart an `error` or `cancelled` job on its active task
    pub async fn retry(&self, status_file: &StatusFile) -> Result<bool> {
        if !status_file.status.is_retryable() {
            return Err(PipelineError::invalid_operation(format!(
                "Job {} is {} and cannot be retried",
                status_file.job_id, status_file.status
            )));
        }
        let task_id = status_file.task_id()?;
        let factory = self.context.registry().factory(&task_id)?;
        if !factory.supports_retry() {
            return Err(PipelineError::invalid_operation(format!(
                "Task {task_id} does not support retry"
            )));
        }

        let mut job = status_file.restore_job()?;
        job.status = JobStatus::Waiting;
        job.info("Retry requested");
        let update = StatusUpdate::for_file(status_file)
            .status(JobStatus::Waiting)
            .clear_host()
            .info("Retry requested")
            .snapshot(&job)?;
        if !self.context.store().update_status_file(update).await?.is_applied() {
            return Ok(false);
        }
        self.enqueue(&job, &status_file.location).await?;
        log_job_operation("retry", Some(job.guid()), Some(&task_id.to_string()), "waiting", None);
        Ok(true)
    }

    /// Administrative completion of the whole job
    pub async fn complete(&self, status_file: &StatusFile) -> Result<StatusFile> {
        let update = StatusUpdate::for_file(status_file)
            .status(JobStatus::Complete)
            .clear_host()
            .info("Marked complete")
            .forced();
        match self.context.store().update_status_file(update).await? {
            UpdateOutcome::Applied(file) => {
                self.context.transport().remove_if_present(file.job_id).await?;
                Ok(file)
            }
            UpdateOutcome::Stale(current) => Err(PipelineError::invalid_operation(format!(
                "Job {} changed to {} while being completed",
                current.job_id, current.status
            ))),
            UpdateOutcome::NotFound => Err(PipelineError::job_not_found(status_file.job_id)),
        }
    }

    /// Remove a settled job's record, queued message and snapshot file
    pub async fn delete(&self, status_file: &StatusFile) -> Result<bool> {
        let Some(current) = self.get_status(status_file.job_id).await? else {
            return Ok(false);
        };
        if current.is_in_flight() {
            return Err(PipelineError::invalid_operation(format!(
                "Job {} is {}; cancel it before deleting",
                current.job_id, current.status
            )));
        }
        self.context.transport().remove_if_present(current.job_id).await?;
        if let Ok(job) = current.restore_job() {
            if let Err(e) = tokio::fs::remove_file(job.snapshot_path()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %current.job_id, error = %e, "Could not delete job snapshot");
                }
            }
        }
        self.context.store().delete_status_file(current.job_id).await
    }

    pub async fn purge_container(&self, container: &str) -> Result<u64> {
        let purged = self.context.store().purge_container(container).await?;
        info!(container = %container, purged, "Container job records purged");
        Ok(purged)
    }

    /// Status reported by a remote worker. A `complete` report advances the
    /// job like a local completion would.
    pub async fn set_status(&self, job_id: Uuid, status: JobStatus, info: Option<String>) -> Result<UpdateOutcome> {
        let file = self
            .get_status(job_id)
            .await?
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;
        let mut update = StatusUpdate::for_file(&file).status(status);
        if status.is_terminal() && status != JobStatus::Complete {
            update = update.clear_host();
        }
        if let Some(info) = info {
            update = update.info(info);
        }
        let outcome = self.context.store().update_status_file(update).await?;

        if let UpdateOutcome::Applied(updated) = &outcome {
            log_job_operation("set_status", Some(job_id), Some(&updated.active_task_id), status.as_str(), None);
            match status {
                JobStatus::Complete => {
                    let mut job = updated.restore_job()?;
                    job.status = JobStatus::Complete;
                    if let AdvanceOutcome::Enqueued(next) = self.context.runner().advance(&mut job).await? {
                        debug!(job_id = %job_id, next_task = %next, "Remote completion advanced");
                    }
                }
                JobStatus::Cancelling => {
                    self.context.cancellations().cancel(job_id);
                }
                _ => {}
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::messaging::Selector;
    use crate::models::TaskId;
    use crate::pipeline::{FnTaskFactory, Task, TaskContext, TaskError, TaskFactory, TaskRegistry};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Task for Noop {
        async fn run(&self, _job: &mut Job, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            Ok(())
        }
    }

    fn service() -> JobService {
        let registry = Arc::new(TaskRegistry::new());
        let stages: Vec<Arc<dyn TaskFactory>> = vec![
            Arc::new(FnTaskFactory::new(TaskId::new("export", "collect"), "local", |_| {
                Ok(Box::new(Noop) as Box<dyn Task>)
            })),
            Arc::new(
                FnTaskFactory::new(TaskId::new("export", "publish"), "remote1", |_| {
                    Ok(Box::new(Noop) as Box<dyn Task>)
                })
                .without_retry(),
            ),
        ];
        registry.register_pipeline("export", stages).unwrap();
        let context = PipelineContext::in_memory(PipelineConfig::default(), registry).unwrap();
        JobService::new(Arc::new(context))
    }

    fn job(name: &str) -> Job {
        Job::new(TaskId::new("export", "collect"), "/proj", name, format!("/tmp/{name}.log"))
    }

    #[tokio::test]
    async fn test_submit_records_and_queues() {
        let service = service();
        let job = job("a");
        let file = service.submit(job.clone()).await.unwrap();
        assert_eq!(file.status, JobStatus::Waiting);
        assert_eq!(file.location, "local");
        assert_eq!(service.queue_position(job.guid()).await.unwrap(), Some(1));
        assert_eq!(
            service.get_status_by_path("/tmp/a.log").await.unwrap().map(|f| f.job_id),
            Some(job.guid())
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_job_removes_it() {
        let service = service();
        let file = service.submit(job("b")).await.unwrap();

        assert!(service.cancel("alice", "/proj", &file).await.unwrap());
        let stored = service.get_status(file.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        let queued = service.context().transport().browse(&Selector::Any).await.unwrap();
        assert!(queued.is_empty());

        assert!(!service.cancel("alice", "/proj", &stored).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_checks_container() {
        let service = service();
        let file = service.submit(job("c")).await.unwrap();
        assert!(service.cancel("bob", "/other", &file).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_after_cancel_requeues() {
        let service = service();
        let file = service.submit(job("d")).await.unwrap();
        service.cancel("alice", "/proj", &file).await.unwrap();
        let cancelled = service.get_status(file.job_id).await.unwrap().unwrap();

        assert!(service.retry(&cancelled).await.unwrap());
        let stored = service.get_status(file.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(service.queue_position(file.job_id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_retry_rejects_active_jobs() {
        let service = service();
        let file = service.submit(job("e")).await.unwrap();
        assert!(matches!(
            service.retry(&file).await,
            Err(PipelineError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_completion_advances() {
        let service = service();
        let file = service.submit(job("f")).await.unwrap();
        service.context().transport().remove_if_present(file.job_id).await.unwrap();

        service.set_status(file.job_id, JobStatus::Running, None).await.unwrap();
        let outcome = service
            .set_status(file.job_id, JobStatus::Complete, Some("done remotely".into()))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let stored = service.get_status(file.job_id).await.unwrap().unwrap();
        assert_eq!(stored.active_task_id, "export/publish");
        assert_eq!(stored.location, "remote1");
        assert_eq!(stored.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_delete_refuses_active_and_removes_settled() {
        let service = service();
        let file = service.submit(job("g")).await.unwrap();
        assert!(service.delete(&file).await.is_err());

        let completed = service.complete(&file).await.unwrap();
        assert_eq!(completed.status, JobStatus::Complete);
        assert!(service.delete(&completed).await.unwrap());
        assert!(service.get_status(file.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_dequeues_and_missing_job_errors() {
        let service = service();
        let file = service.submit(job("j")).await.unwrap();
        service.complete(&file).await.unwrap();
        let queued = service.context().transport().browse(&Selector::Any).await.unwrap();
        assert!(queued.is_empty());

        assert!(service.delete(&file).await.unwrap());
        assert!(matches!(
            service.complete(&file).await,
            Err(PipelineError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_job_on_same_log_path_is_rejected() {
        let service = service();
        service.submit(job("k")).await.unwrap();
        let err = service.submit(job("k")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateLogPath { .. }));
    }

    #[tokio::test]
    async fn test_purge_container() {
        let service = service();
        service.submit(job("h")).await.unwrap();
        service.submit(job("i")).await.unwrap();
        assert_eq!(service.purge_container("/proj").await.unwrap(), 2);
    }
}
