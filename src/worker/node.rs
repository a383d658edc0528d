//! Cluster node entry point: run one serialized job's active task without
//! access to the queue or status store.
//!
//! The snapshot is rewritten in place with the job's log and business state
//! once the task ends; the submitting host reads it back when the scheduler
//! reports the job finished.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::Job;
use crate::pipeline::{TaskContext, TaskError, TaskRegistry};
use crate::state_machine::JobStatus;

/// How the task ended on the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Complete,
    Failed(String),
    Cancelled,
}

impl NodeOutcome {
    /// Process exit code reported to the scheduler
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Failed(_) => 1,
            Self::Cancelled => 2,
        }
    }
}

pub async fn run_job_file(
    registry: &TaskRegistry,
    snapshot: &Path,
    host_name: &str,
    token: CancellationToken,
) -> Result<NodeOutcome> {
    let mut job = Job::read_snapshot_file(snapshot).await?;
    let task_id = job.active_task_id().clone();
    info!(job_id = %job.guid(), task_id = %task_id, host = %host_name, "📦 Running job on cluster node");

    let ctx = TaskContext::new(task_id.clone(), host_name, token);
    job.status = JobStatus::Running;
    job.info(format!("Starting task {task_id} on {host_name}"));

    // An unknown task still ends in the snapshot so the submitter sees why
    let result = match registry.factory(&task_id) {
        Ok(factory) => match factory.create_task(&job) {
            Ok(task) => task.run(&mut job, &ctx).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(TaskError::failed(e.to_string())),
    };
    let outcome = match result {
        Ok(()) => {
            job.status = JobStatus::Complete;
            job.info(format!("Task {task_id} complete"));
            NodeOutcome::Complete
        }
        Err(e) if e.is_cancellation() || ctx.is_cancelled() => {
            job.status = JobStatus::Cancelling;
            job.info("Task stopped after cancellation");
            NodeOutcome::Cancelled
        }
        Err(e) => {
            let message = e.to_string();
            if let Some(detail) = e.detail() {
                job.warn(format!("Detail: {detail}"));
            }
            job.status = JobStatus::Error;
            job.error(&message);
            warn!(job_id = %job.guid(), error = %message, "Task failed on cluster node");
            NodeOutcome::Failed(message)
        }
    };

    let contents = job.to_snapshot()?;
    tokio::fs::write(snapshot, contents).await?;
    Ok(outcome)
}
