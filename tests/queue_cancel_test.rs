//! Queue positions and cancellation racing consumption.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pipeline_core::engines::LocalExecutionEngine;
use pipeline_core::messaging::Selector;
use pipeline_core::{JobService, JobStatus, TaskId};

fn slow_registry(counter: &Arc<Counter>) -> Arc<pipeline_core::pipeline::TaskRegistry> {
    registry(
        "align",
        vec![until_cancelled(
            TaskId::new("align", "map"),
            "local",
            counter,
            Duration::from_secs(30),
        )],
    )
}

#[tokio::test]
async fn test_queue_positions_follow_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Counter::new();
    let context = in_memory_context(fast_config("web1"), slow_registry(&counter));
    let service = JobService::new(Arc::clone(&context));

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let job = job(TaskId::new("align", "map"), name, dir.path());
        ids.push(job.guid());
        service.submit(job).await.unwrap();
    }

    let positions = service.queue_positions("local").await.unwrap();
    assert_eq!(positions.len(), 3);
    for (expected, id) in ids.iter().enumerate() {
        assert_eq!(positions.get(id), Some(&(expected + 1)));
        assert_eq!(service.queue_position(*id).await.unwrap(), Some(expected + 1));
    }
    assert!(service.queue_positions("elsewhere").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_job_leaves_queue() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Counter::new();
    let context = in_memory_context(fast_config("web1"), slow_registry(&counter));
    let service = JobService::new(Arc::clone(&context));

    let first = job(TaskId::new("align", "map"), "first", dir.path());
    let second = job(TaskId::new("align", "map"), "second", dir.path());
    let first_file = service.submit(first.clone()).await.unwrap();
    service.submit(second.clone()).await.unwrap();

    assert!(service.cancel("bob", "/projects/demo", &first_file).await.unwrap());
    let stored = service.get_status(first.guid()).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(service.queue_position(first.guid()).await.unwrap(), None);

    let queued = context.transport().browse(&Selector::location("local")).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].job_id, second.guid());
}

/// Cancel and consumption race; the task runs at most once and the job
/// always ends `cancelled`
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_consumer_has_single_outcome() {
    let dir = tempfile::tempdir().unwrap();
    for round in 0..20 {
        let counter = Counter::new();
        let context = in_memory_context(fast_config("web1"), slow_registry(&counter));
        let service = JobService::new(Arc::clone(&context));
        let engine = Arc::new(LocalExecutionEngine::new(
            Arc::clone(&context),
            vec!["local".to_string()],
        ));

        let job = job(TaskId::new("align", "map"), &format!("race-{round}"), dir.path());
        let file = service.submit(job.clone()).await.unwrap();

        let consumer = {
            let context = Arc::clone(&context);
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let message = context
                    .transport()
                    .receive(&Selector::location("local"), Duration::from_millis(50))
                    .await
                    .unwrap();
                match message {
                    Some(message) => Some(engine.process_message(message).await.unwrap()),
                    None => None,
                }
            })
        };
        let canceller = {
            let service = service.clone();
            tokio::spawn(async move { service.cancel("alice", "/projects/demo", &file).await.unwrap() })
        };

        let cancelled = canceller.await.unwrap();
        assert!(cancelled, "round {round}: cancel should take effect");
        let ran = consumer.await.unwrap();

        let stored = wait_for_status(&service, job.guid(), JobStatus::Cancelled).await;
        assert!(stored.active_host_name.is_none());
        assert!(counter.runs() <= 1, "round {round}: task ran {} times", counter.runs());
        if ran.is_none() {
            assert_eq!(counter.runs(), 0);
        }
        assert!(context.transport().browse(&Selector::Any).await.unwrap().is_empty());
    }
}
