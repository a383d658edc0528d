//! Cluster stages driven through a worker process and the simulated scheduler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pipeline_core::config::{ClusterSettings, PipelineConfig};
use pipeline_core::engines::cluster::{
    CompositeCancellationDetector, FaultKind, ProxyCredential, RemoteFault, RemoteState, SimulatedClusterScheduler,
    StaticCredentialProvider,
};
use pipeline_core::worker::WorkerProcess;
use pipeline_core::{Job, JobService, JobStatus, TaskId};

struct Harness {
    service: JobService,
    scheduler: Arc<SimulatedClusterScheduler>,
    worker: WorkerProcess,
    summarize: Arc<Counter>,
    _dir: tempfile::TempDir,
}

fn cluster_config() -> PipelineConfig {
    let mut config = fast_config("web1");
    config.cluster_engine.enabled = true;
    config.cluster_engine.output_wait_timeout_ms = 100;
    config.cluster_engine.output_poll_interval_ms = 10;
    config.cluster = vec![ClusterSettings {
        location: "cluster1".into(),
        endpoint: "https://cluster1:8443".into(),
        available_queues: vec!["short".into()],
        ..ClusterSettings::default()
    }];
    config
}

async fn harness() -> Harness {
    let convert = Counter::new();
    let summarize = Counter::new();
    let registry = registry(
        "assemble",
        vec![
            recording(TaskId::new("assemble", "convert"), "cluster1", &convert),
            recording(TaskId::new("assemble", "summarize"), "local", &summarize),
        ],
    );
    let context = in_memory_context(cluster_config(), registry);
    let scheduler = Arc::new(SimulatedClusterScheduler::new());
    let worker = WorkerProcess::builder(Arc::clone(&context))
        .with_cluster_scheduler(
            scheduler.clone(),
            Arc::new(StaticCredentialProvider::new(ProxyCredential::new("CN=web1", "token"))),
        )
        .with_cancellation_detector(Arc::new(CompositeCancellationDetector::default()))
        .start()
        .await
        .unwrap();
    Harness {
        service: JobService::new(context),
        scheduler,
        worker,
        summarize,
        _dir: tempfile::tempdir().unwrap(),
    }
}

async fn submitted(h: &Harness, name: &str) -> Job {
    let job = job(TaskId::new("assemble", "convert"), name, h._dir.path());
    h.service.submit(job.clone()).await.unwrap();
    let uri = job.job_uri();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.scheduler.state(&uri).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "job never reached the scheduler");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    job
}

#[tokio::test]
async fn test_cluster_stage_completes_and_advances() {
    let h = harness().await;
    let job = submitted(&h, "genome").await;
    let uri = job.job_uri();

    h.scheduler.set_state(&uri, RemoteState::Active);
    wait_for_status(&h.service, job.guid(), JobStatus::Running).await;

    h.scheduler.set_output(&uri, "assembled 3 contigs", "");
    h.scheduler.set_state(&uri, RemoteState::Done);

    let file = wait_for(&h.service, job.guid(), Duration::from_secs(5), |f| {
        f.status == JobStatus::Complete && f.active_task_id == "assemble/summarize"
    })
    .await;
    assert_eq!(h.summarize.runs(), 1);
    let log = file.restore_job().unwrap();
    assert!(log
        .log_entries()
        .iter()
        .any(|e| e.message.contains("assembled 3 contigs")));

    h.worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_cancellation_on_cluster_becomes_cancelled() {
    let h = harness().await;
    let job = submitted(&h, "canceled-remotely").await;

    h.scheduler.set_state(
        &job.job_uri(),
        RemoteState::Failed(RemoteFault::new(FaultKind::Execution, "Job canceled by the user")),
    );

    let file = wait_for_status(&h.service, job.guid(), JobStatus::Cancelled).await;
    assert!(file.active_host_name.is_none());
    assert_eq!(h.summarize.runs(), 0);

    h.worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_request_reaches_cluster() {
    let h = harness().await;
    let job = submitted(&h, "cancel-me").await;
    h.scheduler.set_state(&job.job_uri(), RemoteState::Active);
    let running = wait_for_status(&h.service, job.guid(), JobStatus::Running).await;

    assert!(h.service.cancel("carol", "/projects/demo", &running).await.unwrap());
    wait_for_status(&h.service, job.guid(), JobStatus::Cancelled).await;

    h.worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cluster_failure_records_error() {
    let h = harness().await;
    let job = submitted(&h, "oom").await;

    h.scheduler.set_state(
        &job.job_uri(),
        RemoteState::Failed(RemoteFault::new(FaultKind::Execution, "exit code 137")),
    );

    let file = wait_for_status(&h.service, job.guid(), JobStatus::Error).await;
    assert_eq!(file.info.as_deref(), Some("Cluster job failed: exit code 137"));
    assert_eq!(h.summarize.runs(), 0);

    h.worker.shutdown().await.unwrap();
}
