//! Shared fixtures for the integration suites: small pipelines, contexts
//! wired with fast timings, and status polling helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use pipeline_core::config::PipelineConfig;
use pipeline_core::messaging::{InMemoryQueueTransport, QueueTransport};
use pipeline_core::pipeline::{FnTaskFactory, Task, TaskContext, TaskError, TaskFactory, TaskRegistry};
use pipeline_core::service::{JobService, PipelineContext};
use pipeline_core::status::{InMemoryLocationLock, InMemoryStatusStore, LocationLock, StatusStore};
use pipeline_core::{Job, JobStatus, StatusFile, TaskId};

/// Config with short queue waits so consumers notice shutdown quickly
pub fn fast_config(host: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.host_name = Some(host.to_string());
    config.queue.receive_wait_ms = 20;
    config.queue.poll_interval_ms = 10;
    config.local.heartbeat_interval_ms = 25;
    config.local.shutdown_grace_period_ms = 200;
    config.remote.poll_interval_ms = 50;
    config
}

/// Counts runs and records the stage on the job's business state
#[derive(Debug, Default)]
pub struct Counter {
    runs: AtomicUsize,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct RecordStage {
    counter: Arc<Counter>,
}

#[async_trait]
impl Task for RecordStage {
    async fn run(&self, job: &mut Job, ctx: &TaskContext) -> Result<(), TaskError> {
        self.counter.hit();
        let stage = job.active_task_id().stage().to_string();
        let mut stages = job.state.get("stages").cloned().unwrap_or_else(|| serde_json::json!([]));
        if let Some(list) = stages.as_array_mut() {
            list.push(serde_json::Value::String(stage));
        }
        job.state = serde_json::json!({ "stages": stages });
        job.info(format!("ran on {}", ctx.host_name));
        Ok(())
    }
}

/// Fails with an I/O error, the way a missing input file would
pub struct MissingInput {
    counter: Arc<Counter>,
}

#[async_trait]
impl Task for MissingInput {
    async fn run(&self, _job: &mut Job, _ctx: &TaskContext) -> Result<(), TaskError> {
        self.counter.hit();
        Err(TaskError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "samples.tsv not found",
        )))
    }
}

/// Runs until cancelled, giving up after `limit`
pub struct UntilCancelled {
    counter: Arc<Counter>,
    limit: Duration,
}

#[async_trait]
impl Task for UntilCancelled {
    async fn run(&self, _job: &mut Job, ctx: &TaskContext) -> Result<(), TaskError> {
        self.counter.hit();
        tokio::select! {
            _ = ctx.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(self.limit) => Ok(()),
        }
    }
}

pub fn recording(id: TaskId, location: &str, counter: &Arc<Counter>) -> Arc<dyn TaskFactory> {
    let counter = Arc::clone(counter);
    Arc::new(FnTaskFactory::new(id, location, move |_| {
        Ok(Box::new(RecordStage {
            counter: Arc::clone(&counter),
        }) as Box<dyn Task>)
    }))
}

pub fn missing_input(id: TaskId, location: &str, counter: &Arc<Counter>) -> Arc<dyn TaskFactory> {
    let counter = Arc::clone(counter);
    Arc::new(FnTaskFactory::new(id, location, move |_| {
        Ok(Box::new(MissingInput {
            counter: Arc::clone(&counter),
        }) as Box<dyn Task>)
    }))
}

pub fn until_cancelled(id: TaskId, location: &str, counter: &Arc<Counter>, limit: Duration) -> Arc<dyn TaskFactory> {
    let counter = Arc::clone(counter);
    Arc::new(FnTaskFactory::new(id, location, move |_| {
        Ok(Box::new(UntilCancelled {
            counter: Arc::clone(&counter),
            limit,
        }) as Box<dyn Task>)
    }))
}

pub fn registry(pipeline: &str, stages: Vec<Arc<dyn TaskFactory>>) -> Arc<TaskRegistry> {
    let registry = Arc::new(TaskRegistry::new());
    registry
        .register_pipeline(pipeline, stages)
        .expect("pipeline registers");
    registry
}

pub fn in_memory_context(config: PipelineConfig, registry: Arc<TaskRegistry>) -> Arc<PipelineContext> {
    Arc::new(PipelineContext::in_memory(config, registry).expect("valid config"))
}

/// Backends shared between several simulated hosts
#[derive(Clone)]
pub struct SharedBackends {
    pub store: Arc<dyn StatusStore>,
    pub transport: Arc<dyn QueueTransport>,
    pub lock: Arc<dyn LocationLock>,
}

impl SharedBackends {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStatusStore::new()),
            transport: Arc::new(InMemoryQueueTransport::new()),
            lock: Arc::new(InMemoryLocationLock::new()),
        }
    }

    pub fn context(&self, config: PipelineConfig, registry: Arc<TaskRegistry>) -> Arc<PipelineContext> {
        Arc::new(PipelineContext::from_parts(
            config,
            registry,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.lock),
        ))
    }
}

pub fn job(first: TaskId, name: &str, dir: &std::path::Path) -> Job {
    Job::new(first, "/projects/demo", name, dir.join(format!("{name}.log")))
}

/// Poll the status store until `done` holds or `timeout` passes
pub async fn wait_for<F>(service: &JobService, job_id: Uuid, timeout: Duration, done: F) -> StatusFile
where
    F: Fn(&StatusFile) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(file) = service.get_status(job_id).await.expect("status read") {
            if done(&file) {
                return file;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("job {job_id} stuck at {} on {}", file.status, file.active_task_id);
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} has no status file");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(service: &JobService, job_id: Uuid, status: JobStatus) -> StatusFile {
    wait_for(service, job_id, Duration::from_secs(5), |file| file.status == status).await
}
