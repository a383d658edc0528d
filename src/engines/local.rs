//! # Local Execution Engine
//!
//! Runs tasks for its locations inside this process.
//!
//! ```text
//! receive(locations) ──► [Semaphore] ──► consume_scope {
//!                                          run_active_task   (panics caught)
//!                                          every heartbeat:  renew lease,
//!                                                            cancelling? -> fire token
//!                                        }
//! ```
//!
//! Permits are taken before a message is received, so a full engine leaves
//! messages on the queue for other consumers. Messages published while a
//! task runs are flushed when its handler returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::messaging::{JobMessage, Selector};
use crate::pipeline::RunOutcome;
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;

pub struct LocalExecutionEngine {
    context: Arc<PipelineContext>,
    locations: Vec<String>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl std::fmt::Debug for LocalExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutionEngine")
            .field("locations", &self.locations)
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}

impl LocalExecutionEngine {
    pub fn new(context: Arc<PipelineContext>, locations: Vec<String>) -> Self {
        let max_concurrent = context.config().local.max_concurrent_jobs.max(1);
        Self {
            context,
            locations,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    /// Free execution slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Consume until shutdown, then give in-flight tasks the grace period
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let selector = Selector::locations(self.locations.iter().cloned());
        let wait = self.context.config().queue.receive_wait();
        let mut in_flight = JoinSet::new();
        info!(
            locations = ?self.locations,
            max_concurrent = self.max_concurrent,
            "🚀 Local execution engine started"
        );

        while !shutdown.is_cancelled() {
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Execution semaphore closed; stopping consumer");
                        break;
                    }
                },
            };

            // receive is not raced against shutdown: a PostgreSQL consume
            // dropped mid-query could lose the message
            match self.context.transport().receive(&selector, wait).await {
                Ok(Some(message)) => {
                    let engine = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let job_id = message.job_id;
                        match engine.process_message(message).await {
                            Ok(outcome) => debug!(job_id = %job_id, outcome = ?outcome, "Local task handled"),
                            Err(e) => error!(job_id = %job_id, error = %e, "Local task handling failed"),
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Queue receive failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.context.config().queue.poll_interval()) => {}
                    }
                }
            }
        }

        self.drain(&mut in_flight).await;
        info!(locations = ?self.locations, "🛑 Local execution engine stopped");
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        let grace = self.context.config().local.shutdown_grace_period();
        info!(in_flight = in_flight.len(), grace = ?grace, "Waiting for in-flight tasks");
        let finished = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Grace period elapsed; abandoning tasks to the next recovery sweep"
            );
            in_flight.abort_all();
        }
    }

    /// Run one consumed message to completion
    pub async fn process_message(&self, message: JobMessage) -> Result<RunOutcome> {
        let job = match message.to_job() {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "Dropping unreadable message");
                return Ok(RunOutcome::Skipped);
            }
        };
        let job_id = job.guid();
        let dispatcher = Arc::clone(self.context.dispatcher());

        dispatcher
            .consume_scope(async {
                let runner = self.context.runner();
                let run = AssertUnwindSafe(runner.run_active_task(job.clone())).catch_unwind();
                tokio::pin!(run);

                let mut heartbeat = tokio::time::interval(self.context.config().local.heartbeat_interval());
                heartbeat.tick().await;
                let result = loop {
                    tokio::select! {
                        result = &mut run => break result,
                        _ = heartbeat.tick() => self.heartbeat(job_id).await,
                    }
                };

                match result {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(job_id = %job_id, panic = %detail, "Task panicked");
                        self.context.cancellations().remove(job_id);
                        let message = format!("Task panicked: {detail}");
                        let mut failed = job.clone();
                        runner
                            .mark_error(&mut failed, &message)
                            .await
                            .map(|_| RunOutcome::Failed(message))
                    }
                }
            })
            .await?
    }

    /// Keep our lease fresh and pick up cancels requested from other processes
    async fn heartbeat(&self, job_id: Uuid) {
        let file = match self.context.store().get_status_file(job_id).await {
            Ok(Some(file)) => file,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Heartbeat status read failed");
                return;
            }
        };
        if file.status == JobStatus::Cancelling {
            if self.context.cancellations().cancel(job_id) {
                info!(job_id = %job_id, "Cancellation observed by heartbeat");
            }
            return;
        }
        if let Err(e) = self
            .context
            .store()
            .renew_host_lease(job_id, self.context.host_name())
            .await
        {
            warn!(job_id = %job_id, error = %e, "Host lease renewal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::models::{Job, StatusFile, TaskId};
    use crate::pipeline::{FnTaskFactory, Task, TaskContext, TaskError, TaskFactory, TaskRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Panics;

    #[async_trait]
    impl Task for Panics {
        async fn run(&self, _job: &mut Job, _ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            panic!("boom");
        }
    }

    struct WaitsForCancel;

    #[async_trait]
    impl Task for WaitsForCancel {
        async fn run(&self, _job: &mut Job, ctx: &TaskContext) -> std::result::Result<(), TaskError> {
            ctx.cancelled().await;
            Err(TaskError::Cancelled)
        }
    }

    async fn context_with(task: fn() -> Box<dyn Task>) -> (Arc<PipelineContext>, Job) {
        let mut config = PipelineConfig::default();
        config.local.heartbeat_interval_ms = 20;
        let registry = Arc::new(TaskRegistry::new());
        let factory: Arc<dyn TaskFactory> = Arc::new(FnTaskFactory::new(
            TaskId::new("demo", "only"),
            "local",
            move |_| Ok(task()),
        ));
        registry.register_pipeline("demo", vec![factory]).unwrap();
        let context = Arc::new(PipelineContext::in_memory(config, registry).unwrap());
        let job = Job::new(TaskId::new("demo", "only"), "/c", "demo", "/tmp/demo.log");
        context
            .store()
            .insert_or_replace(StatusFile::for_job(&job, "local").unwrap())
            .await
            .unwrap();
        (context, job)
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_error() {
        let (context, job) = context_with(|| Box::new(Panics) as Box<dyn Task>).await;
        let engine = LocalExecutionEngine::new(Arc::clone(&context), vec!["local".into()]);
        let outcome = engine
            .process_message(JobMessage::for_job(&job, "local").unwrap())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("boom")));
        let file = context.store().get_status_file(job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Error);
        assert!(context.cancellations().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_delivers_cross_process_cancel() {
        let (context, job) = context_with(|| Box::new(WaitsForCancel) as Box<dyn Task>).await;
        let engine = LocalExecutionEngine::new(Arc::clone(&context), vec!["local".into()]);

        let store = Arc::clone(context.store());
        let file_job = job.clone();
        let canceller = tokio::spawn(async move {
            loop {
                let file = store.get_status_file(file_job.guid()).await.unwrap().unwrap();
                if file.status == JobStatus::Running {
                    let update = crate::status::StatusUpdate::for_file(&file).status(JobStatus::Cancelling);
                    store.update_status_file(update).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            engine.process_message(JobMessage::for_job(&job, "local").unwrap()),
        )
        .await
        .unwrap()
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        let file = context.store().get_status_file(job.guid()).await.unwrap().unwrap();
        assert_eq!(file.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_engine_stops_on_shutdown() {
        let (context, _job) = context_with(|| Box::new(Panics) as Box<dyn Task>).await;
        let engine = Arc::new(LocalExecutionEngine::new(context, vec!["local".into()]));
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&engine).spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.available_permits(), 4);
    }
}
