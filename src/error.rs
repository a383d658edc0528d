//! # Error Types
//!
//! Crate-level error type. Each layer keeps its own `thiserror` enum and
//! converts into [`PipelineError`] at the service boundary.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::engines::cluster::ClusterError;
use crate::engines::remote::RemoteEngineError;
use crate::messaging::MessagingError;
use crate::state_machine::StateMachineError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateMachineError),

    #[error("Remote engine error: {0}")]
    RemoteEngine(#[from] RemoteEngineError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: Uuid },

    #[error("No status file for path: {path}")]
    StatusFileNotFound { path: String },

    #[error("Log path {path} already belongs to another job")]
    DuplicateLogPath { path: String },

    #[error("Unknown task: {task_id}")]
    UnknownTask { task_id: String },

    #[error("Unknown pipeline: {pipeline}")]
    UnknownPipeline { pipeline: String },

    #[error("Invalid job snapshot: {message}")]
    InvalidSnapshot { message: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::JobNotFound { job_id }
    }

    pub fn duplicate_log_path(path: impl Into<String>) -> Self {
        Self::DuplicateLogPath { path: path.into() }
    }

    pub fn unknown_task(task_id: impl ToString) -> Self {
        Self::UnknownTask {
            task_id: task_id.to_string(),
        }
    }

    pub fn unknown_pipeline(pipeline: impl Into<String>) -> Self {
        Self::UnknownPipeline {
            pipeline: pipeline.into(),
        }
    }

    pub fn invalid_snapshot(message: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
