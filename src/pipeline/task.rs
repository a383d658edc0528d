//! # Task
//!
//! One runnable pipeline stage. Tasks receive the job mutably so they can
//! log progress and update its business state, plus a [`TaskContext`]
//! carrying the cancellation token the canceller fires.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{Job, TaskId};

#[derive(Error, Debug)]
pub enum TaskError {
    /// The task observed a cancellation request and stopped
    #[error("Task cancelled")]
    Cancelled,

    /// Recorded with the underlying message only; the kind goes to the detail
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Failed {
        message: String,
        detail: Option<String>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            detail: None,
        }
    }

    pub fn failed_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Extra diagnostic text recorded on the job log
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Failed { detail, .. } => detail.clone(),
            Self::Io(e) => Some(format!("{:?}", e.kind())),
            Self::Other(e) => {
                let chain: Vec<String> = e.chain().skip(1).map(|c| c.to_string()).collect();
                (!chain.is_empty()).then(|| chain.join(": "))
            }
            Self::Cancelled => None,
        }
    }
}

/// Per-run context handed to [`Task::run`]
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub host_name: String,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, host_name: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            task_id,
            host_name: host_name.into(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once cancellation was requested
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, job: &mut Job, ctx: &TaskContext) -> Result<(), TaskError>;
}
