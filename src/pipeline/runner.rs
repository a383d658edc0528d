//! # Job Runner
//!
//! Drives one job through its active task and on to the next one.
//!
//! ## Flow
//!
//! ```text
//! run_active_task(job)
//!   ├── status file moved on?         -> Skipped
//!   ├── cancelling                    -> confirm_cancel
//!   ├── complete (advance was lost)   -> advance
//!   └── waiting
//!         ├── mark running (host, snapshot)
//!         ├── Task::run
//!         ├── Ok             -> complete -> advance
//!         ├── Cancelled      -> confirm_cancel
//!         └── Err            -> error (message + detail on log and info)
//!
//! advance(job)
//!   ├── next task   -> waiting on next task, enqueue at its location
//!   └── last task   -> complete, host cleared
//! ```
//!
//! Every status change names the task it was issued for, so a duplicate
//! message or a second worker racing on the same job turns into a stale
//! no-op rather than a double run or double advance.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::registry::TaskRegistry;
use super::task::{TaskContext, TaskError};
use crate::error::{PipelineError, Result};
use crate::logging::log_job_operation;
use crate::messaging::{JobMessage, QueueDispatcher};
use crate::models::{Job, TaskId};
use crate::service::CancellationRegistry;
use crate::state_machine::{JobEvent, JobStateMachine, JobStatus};
use crate::status::{StatusStore, StatusUpdate, UpdateOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Task finished; carries what the advance did
    Completed(AdvanceOutcome),
    Failed(String),
    Cancelled,
    /// Another worker owns the task, or it already moved on
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Next task recorded and queued
    Enqueued(TaskId),
    /// Last task done; job is terminal `complete`
    Finished,
    /// Someone else already advanced this task
    Duplicate,
}

pub struct JobRunner {
    store: Arc<dyn StatusStore>,
    dispatcher: Arc<QueueDispatcher>,
    registry: Arc<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
    host_name: String,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("store", &self.store.provider_name())
            .field("registry", &self.registry)
            .field("host_name", &self.host_name)
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn StatusStore>,
        dispatcher: Arc<QueueDispatcher>,
        registry: Arc<TaskRegistry>,
        cancellations: Arc<CancellationRegistry>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            cancellations,
            host_name: host_name.into(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run the job's active task in this process
    #[instrument(skip(self, job), fields(job_id = %job.guid(), task_id = %job.active_task_id()))]
    pub async fn run_active_task(&self, mut job: Job) -> Result<RunOutcome> {
        let task_id = job.active_task_id().clone();
        let current = self
            .store
            .get_status_file(job.guid())
            .await?
            .ok_or_else(|| PipelineError::job_not_found(job.guid()))?;

        if current.active_task_id != task_id.to_string() {
            debug!(stored_task = %current.active_task_id, "Task already moved on; skipping");
            return Ok(RunOutcome::Skipped);
        }
        match current.status {
            JobStatus::Waiting => {}
            JobStatus::Cancelling => {
                self.confirm_cancel(&mut job).await?;
                return Ok(RunOutcome::Cancelled);
            }
            JobStatus::Complete => {
                job.status = JobStatus::Complete;
                let advanced = self.advance(&mut job).await?;
                return Ok(RunOutcome::Completed(advanced));
            }
            other => {
                debug!(status = %other, "Job not waiting; skipping");
                return Ok(RunOutcome::Skipped);
            }
        }

        job.status = JobStatus::Waiting;
        let factory = match self.registry.factory(&task_id) {
            Ok(factory) => factory,
            Err(e) => {
                let message = e.to_string();
                self.mark_error(&mut job, &message).await?;
                return Ok(RunOutcome::Failed(message));
            }
        };

        let token = self.cancellations.register(job.guid());
        let outcome = self.execute(&mut job, factory.as_ref(), token).await;
        self.cancellations.remove(job.guid());
        outcome
    }

    async fn execute(
        &self,
        job: &mut Job,
        factory: &dyn super::TaskFactory,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<RunOutcome> {
        let task_id = job.active_task_id().clone();

        job.status = JobStateMachine::determine_target_state(job.status, &JobEvent::Start)?;
        let started = format!("Starting task {task_id} on {}", self.host_name);
        job.info(started);
        let start = StatusUpdate::for_job(job)
            .status(JobStatus::Running)
            .host(&self.host_name)
            .snapshot(job)?;
        match self.store.update_status_file(start).await? {
            UpdateOutcome::Applied(_) => {}
            UpdateOutcome::Stale(current) if current.status == JobStatus::Cancelling => {
                self.confirm_cancel(job).await?;
                return Ok(RunOutcome::Cancelled);
            }
            UpdateOutcome::Stale(_) => return Ok(RunOutcome::Skipped),
            UpdateOutcome::NotFound => return Err(PipelineError::job_not_found(job.guid())),
        }
        log_job_operation(
            "run",
            Some(job.guid()),
            Some(&task_id.to_string()),
            "running",
            Some(&self.host_name),
        );

        let ctx = TaskContext::new(task_id.clone(), &self.host_name, token.clone());
        let result = match factory.create_task(job) {
            Ok(task) => task.run(job, &ctx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.finish_success(job).await,
            Err(e) if e.is_cancellation() || token.is_cancelled() => {
                debug!(error = %e, "Task stopped after cancellation request");
                self.confirm_cancel(job).await?;
                Ok(RunOutcome::Cancelled)
            }
            Err(e) => self.finish_failure(job, e).await,
        }
    }

    async fn finish_success(&self, job: &mut Job) -> Result<RunOutcome> {
        job.status = JobStatus::Complete;
        let done = format!("Task {} complete", job.active_task_id());
        job.info(done);
        let update = StatusUpdate::for_job(job)
            .status(JobStatus::Complete)
            .snapshot(job)?;
        match self.store.update_status_file(update).await? {
            UpdateOutcome::Applied(_) => {
                let advanced = self.advance(job).await?;
                Ok(RunOutcome::Completed(advanced))
            }
            UpdateOutcome::Stale(current) if current.status == JobStatus::Cancelling => {
                self.confirm_cancel(job).await?;
                Ok(RunOutcome::Cancelled)
            }
            UpdateOutcome::Stale(_) => Ok(RunOutcome::Skipped),
            UpdateOutcome::NotFound => Err(PipelineError::job_not_found(job.guid())),
        }
    }

    async fn finish_failure(&self, job: &mut Job, error: TaskError) -> Result<RunOutcome> {
        let message = error.to_string();
        if let Some(detail) = error.detail() {
            job.warn(format!("Detail: {detail}"));
        }
        warn!(job_id = %job.guid(), error = %message, "Task failed");
        match self.mark_error(job, &message).await? {
            UpdateOutcome::Stale(current) if current.status == JobStatus::Cancelling => {
                self.confirm_cancel(job).await?;
                Ok(RunOutcome::Cancelled)
            }
            _ => Ok(RunOutcome::Failed(message)),
        }
    }

    /// Move a `complete` job on to its next task, or finalize it
    #[instrument(skip(self, job), fields(job_id = %job.guid(), task_id = %job.active_task_id()))]
    pub async fn advance(&self, job: &mut Job) -> Result<AdvanceOutcome> {
        if job.status != JobStatus::Complete {
            return Err(PipelineError::invalid_operation(format!(
                "Cannot advance job {} while {}",
                job.guid(),
                job.status
            )));
        }
        let current_task = job.active_task_id().clone();

        let Some(next_task) = self.registry.next_task(&current_task)? else {
            let update = StatusUpdate::for_job(job)
                .status(JobStatus::Complete)
                .clear_host()
                .snapshot(job)?;
            return match self.store.update_status_file(update).await? {
                UpdateOutcome::Applied(_) => {
                    log_job_operation(
                        "finalize",
                        Some(job.guid()),
                        Some(&current_task.to_string()),
                        "complete",
                        None,
                    );
                    Ok(AdvanceOutcome::Finished)
                }
                UpdateOutcome::Stale(_) => Ok(AdvanceOutcome::Duplicate),
                UpdateOutcome::NotFound => Err(PipelineError::job_not_found(job.guid())),
            };
        };

        let location = self.registry.location_for(&next_task)?;
        let mut next_job = job.clone();
        next_job.set_active_task(next_task.clone());
        next_job.status = JobStateMachine::determine_target_state(JobStatus::Complete, &JobEvent::Advance)?;

        let update = StatusUpdate::for_task(job.guid(), &current_task)
            .status(JobStatus::Waiting)
            .advance_to(&next_task, &location)
            .clear_host()
            .snapshot(&next_job)?;
        match self.store.update_status_file(update).await? {
            UpdateOutcome::Applied(_) => {}
            UpdateOutcome::Stale(current) => {
                debug!(stored_task = %current.active_task_id, "Advance already recorded");
                return Ok(AdvanceOutcome::Duplicate);
            }
            UpdateOutcome::NotFound => return Err(PipelineError::job_not_found(job.guid())),
        }

        *job = next_job;
        let message = JobMessage::for_job(job, &location)?;
        if let Err(e) = self.dispatcher.publish(message).await {
            self.mark_error(job, &format!("Failed to enqueue task {next_task}: {e}"))
                .await?;
            return Err(e.into());
        }
        log_job_operation(
            "advance",
            Some(job.guid()),
            Some(&next_task.to_string()),
            "waiting",
            Some(&location),
        );
        Ok(AdvanceOutcome::Enqueued(next_task))
    }

    /// Record a pending cancellation as `cancelled`
    pub async fn confirm_cancel(&self, job: &mut Job) -> Result<bool> {
        job.status = JobStatus::Cancelled;
        job.info("Job cancelled");
        let update = StatusUpdate::for_job(job)
            .status(JobStatus::Cancelled)
            .clear_host()
            .info("Cancelled")
            .snapshot(job)?;
        let outcome = self.store.update_status_file(update).await?;
        if outcome.is_applied() {
            info!(job_id = %job.guid(), "🛑 Job cancelled");
            log_job_operation("cancel", Some(job.guid()), None, "cancelled", None);
        }
        Ok(outcome.is_applied())
    }

    /// Record a terminal error with its message on the job log and status
    pub async fn mark_error(&self, job: &mut Job, message: &str) -> Result<UpdateOutcome> {
        job.status = JobStatus::Error;
        job.error(message);
        let update = StatusUpdate::for_job(job)
            .status(JobStatus::Error)
            .clear_host()
            .info(message)
            .snapshot(job)?;
        let outcome = self.store.update_status_file(update).await?;
        if outcome.is_applied() {
            log_job_operation("error", Some(job.guid()), None, "error", Some(message));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryQueueTransport, QueueTransport, Selector};
    use crate::models::StatusFile;
    use crate::pipeline::{FnTaskFactory, Task, TaskFactory};
    use crate::status::InMemoryStatusStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Succeed;

    #[async_trait]
    impl Task for Succeed {
        async fn run(&self, job: &mut Job, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            job.info("did work");
            Ok(())
        }
    }

    struct Explode;

    #[async_trait]
    impl Task for Explode {
        async fn run(&self, _job: &mut Job, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            Err(TaskError::failed_with_detail("disk full", "/data"))
        }
    }

    struct Harness {
        store: Arc<InMemoryStatusStore>,
        transport: Arc<InMemoryQueueTransport>,
        runner: JobRunner,
    }

    fn harness(second: Arc<dyn TaskFactory>) -> Harness {
        let registry = Arc::new(TaskRegistry::new());
        let first: Arc<dyn TaskFactory> = Arc::new(FnTaskFactory::new(
            TaskId::new("import", "load"),
            "local",
            |_| Ok(Box::new(Succeed) as Box<dyn Task>),
        ));
        registry.register_pipeline("import", vec![first, second]).unwrap();
        let store = Arc::new(InMemoryStatusStore::new());
        let transport = Arc::new(InMemoryQueueTransport::new());
        let runner = JobRunner::new(
            store.clone(),
            Arc::new(QueueDispatcher::new(transport.clone())),
            registry,
            Arc::new(CancellationRegistry::new()),
            "web1",
        );
        Harness { store, transport, runner }
    }

    fn convert(task: fn() -> Box<dyn Task>) -> Arc<dyn TaskFactory> {
        Arc::new(FnTaskFactory::new(
            TaskId::new("import", "convert"),
            "cluster1",
            move |_| Ok(task()),
        ))
    }

    async fn submitted(h: &Harness) -> Job {
        let job = Job::new(TaskId::new("import", "load"), "/c", "d", "/tmp/runner.log");
        h.store
            .insert_or_replace(StatusFile::for_job(&job, "local").unwrap())
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn test_success_advances_to_next_location() {
        let h = harness(convert(|| Box::new(Succeed) as Box<dyn Task>));
        let job = submitted(&h).await;

        let outcome = h.runner.run_active_task(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed(AdvanceOutcome::Enqueued(TaskId::new("import", "convert")))
        );

        let file = h.store.get_status_file(job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Waiting);
        assert_eq!(file.active_task_id, "import/convert");
        assert_eq!(file.location, "cluster1");
        assert!(file.active_host_name.is_none());

        let queued = h
            .transport
            .receive(&Selector::location("cluster1"), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.job_id, job.guid());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let h = harness(convert(|| Box::new(Succeed) as Box<dyn Task>));
        let job = submitted(&h).await;
        h.runner.run_active_task(job.clone()).await.unwrap();

        let again = h.runner.run_active_task(job).await.unwrap();
        assert_eq!(again, RunOutcome::Skipped);
        assert_eq!(h.transport.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_records_message() {
        let h = harness(convert(|| Box::new(Explode) as Box<dyn Task>));
        let job = submitted(&h).await;
        h.runner.run_active_task(job.clone()).await.unwrap();
        let next = h
            .transport
            .receive(&Selector::Any, Duration::ZERO)
            .await
            .unwrap()
            .unwrap()
            .to_job()
            .unwrap();

        let outcome = h.runner.run_active_task(next).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed("disk full".into()));
        let file = h.store.get_status_file(job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Error);
        assert_eq!(file.info.as_deref(), Some("disk full"));
        let stored = file.restore_job().unwrap();
        assert_eq!(stored.last_error(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_pending_cancel_never_runs_task() {
        let h = harness(convert(|| Box::new(Succeed) as Box<dyn Task>));
        let job = submitted(&h).await;
        h.store
            .update_status_file(StatusUpdate::for_job(&job).status(JobStatus::Cancelling))
            .await
            .unwrap();

        let outcome = h.runner.run_active_task(job.clone()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        let file = h.store.get_status_file(job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Cancelled);
        assert!(h.transport.is_empty());
    }

    #[tokio::test]
    async fn test_advance_is_idempotent() {
        let h = harness(convert(|| Box::new(Succeed) as Box<dyn Task>));
        let mut job = submitted(&h).await;
        h.store
            .update_status_file(StatusUpdate::for_job(&job).status(JobStatus::Running))
            .await
            .unwrap();
        h.store
            .update_status_file(StatusUpdate::for_job(&job).status(JobStatus::Complete))
            .await
            .unwrap();
        job.status = JobStatus::Complete;

        let mut duplicate = job.clone();
        assert!(matches!(
            h.runner.advance(&mut job).await.unwrap(),
            AdvanceOutcome::Enqueued(_)
        ));
        assert_eq!(
            h.runner.advance(&mut duplicate).await.unwrap(),
            AdvanceOutcome::Duplicate
        );
        assert_eq!(h.transport.len(), 1);
    }

    #[tokio::test]
    async fn test_advance_requires_complete() {
        let h = harness(convert(|| Box::new(Succeed) as Box<dyn Task>));
        let mut job = submitted(&h).await;
        assert!(matches!(
            h.runner.advance(&mut job).await,
            Err(PipelineError::InvalidOperation { .. })
        ));
    }
}
