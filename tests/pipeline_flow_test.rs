//! End-to-end runs through a started worker process with in-memory backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pipeline_core::config::RemoteServerConfig;
use pipeline_core::messaging::Selector;
use pipeline_core::worker::WorkerProcess;
use pipeline_core::{JobService, JobStatus, TaskId};

#[tokio::test]
async fn test_two_stage_pipeline_completes() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Counter::new();
    let registry = registry(
        "ingest",
        vec![
            recording(TaskId::new("ingest", "fetch"), "local", &counter),
            recording(TaskId::new("ingest", "index"), "local", &counter),
        ],
    );
    let context = in_memory_context(fast_config("web1"), registry);
    let worker = WorkerProcess::start(Arc::clone(&context)).await.unwrap();
    let service = JobService::new(Arc::clone(&context));

    let job = job(TaskId::new("ingest", "fetch"), "nightly", dir.path());
    service.submit(job.clone()).await.unwrap();

    let file = wait_for(&service, job.guid(), Duration::from_secs(5), |f| {
        f.status == JobStatus::Complete && f.active_task_id == "ingest/index"
    })
    .await;
    assert!(file.active_host_name.is_none());
    assert_eq!(counter.runs(), 2);

    let stored = file.restore_job().unwrap();
    assert_eq!(stored.state["stages"], serde_json::json!(["fetch", "index"]));
    assert!(context.transport().browse(&Selector::Any).await.unwrap().is_empty());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_stage_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let failing = Counter::new();
    let finalize = Counter::new();
    let registry = registry(
        "report",
        vec![
            missing_input(TaskId::new("report", "load"), "local", &failing),
            recording(TaskId::new("report", "finalize"), "local", &finalize),
        ],
    );
    let context = in_memory_context(fast_config("web1"), registry);
    let worker = WorkerProcess::start(Arc::clone(&context)).await.unwrap();
    let service = JobService::new(Arc::clone(&context));

    let job = job(TaskId::new("report", "load"), "weekly", dir.path());
    service.submit(job.clone()).await.unwrap();

    let file = wait_for_status(&service, job.guid(), JobStatus::Error).await;
    assert_eq!(file.active_task_id, "report/load");
    assert_eq!(file.info.as_deref(), Some("samples.tsv not found"));

    let stored = file.restore_job().unwrap();
    assert_eq!(stored.error_count(), 1);
    assert_eq!(stored.last_error(), Some("samples.tsv not found"));

    // Give a wrongly queued finalize stage the chance to run before checking
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing.runs(), 1);
    assert_eq!(finalize.runs(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_running_job_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Counter::new();
    let registry = registry(
        "render",
        vec![until_cancelled(
            TaskId::new("render", "frames"),
            "local",
            &counter,
            Duration::from_secs(30),
        )],
    );
    let context = in_memory_context(fast_config("web1"), registry);
    let worker = WorkerProcess::start(Arc::clone(&context)).await.unwrap();
    let service = JobService::new(Arc::clone(&context));

    let job = job(TaskId::new("render", "frames"), "movie", dir.path());
    service.submit(job.clone()).await.unwrap();
    let running = wait_for_status(&service, job.guid(), JobStatus::Running).await;
    assert_eq!(running.active_host_name.as_deref(), Some("web1"));

    assert!(service.cancel("alice", "/projects/demo", &running).await.unwrap());
    let file = wait_for_status(&service, job.guid(), JobStatus::Cancelled).await;
    assert!(file.active_host_name.is_none());
    assert_eq!(counter.runs(), 1);

    // Settled jobs ignore further cancels
    assert!(!service.cancel("alice", "/projects/demo", &file).await.unwrap());
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_after_failure_runs_again() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Counter::new();
    let registry = registry(
        "report",
        vec![missing_input(TaskId::new("report", "load"), "local", &counter)],
    );
    let context = in_memory_context(fast_config("web1"), registry);
    let worker = WorkerProcess::start(Arc::clone(&context)).await.unwrap();
    let service = JobService::new(Arc::clone(&context));

    let job = job(TaskId::new("report", "load"), "weekly", dir.path());
    service.submit(job.clone()).await.unwrap();
    let failed = wait_for_status(&service, job.guid(), JobStatus::Error).await;

    assert!(service.retry(&failed).await.unwrap());
    wait_for(&service, job.guid(), Duration::from_secs(5), |_| counter.runs() == 2).await;
    let file = wait_for_status(&service, job.guid(), JobStatus::Error).await;
    assert_eq!(file.restore_job().unwrap().error_count(), 2);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stage_runs_on_remote_worker_lane() {
    let dir = tempfile::tempdir().unwrap();
    let backends = SharedBackends::new();
    let collect = Counter::new();
    let publish = Counter::new();
    let registry = registry(
        "export",
        vec![
            recording(TaskId::new("export", "collect"), "local", &collect),
            recording(TaskId::new("export", "publish"), "remote1", &publish),
        ],
    );

    let mut web_config = fast_config("web1");
    web_config.remote.servers = vec![RemoteServerConfig {
        location: "remote1".into(),
    }];
    let web = backends.context(web_config, Arc::clone(&registry));

    let mut node_config = fast_config("node1");
    node_config.local.locations = vec!["remote1:worker".into()];
    let node = backends.context(node_config, Arc::clone(&registry));

    let web_worker = WorkerProcess::start(Arc::clone(&web)).await.unwrap();
    let node_worker = WorkerProcess::start(Arc::clone(&node)).await.unwrap();
    let service = JobService::new(Arc::clone(&web));

    let job = job(TaskId::new("export", "collect"), "archive", dir.path());
    service.submit(job.clone()).await.unwrap();

    let file = wait_for(&service, job.guid(), Duration::from_secs(5), |f| {
        f.status == JobStatus::Complete && f.active_task_id == "export/publish"
    })
    .await;
    assert_eq!(file.location, "remote1");
    assert_eq!(collect.runs(), 1);
    assert_eq!(publish.runs(), 1);
    let log = file.restore_job().unwrap();
    assert!(log.log_entries().iter().any(|e| e.message.contains("ran on node1")));

    node_worker.shutdown().await.unwrap();
    web_worker.shutdown().await.unwrap();
}
