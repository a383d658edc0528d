use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessagingError;
use crate::models::{Job, TaskId};
use crate::state_machine::JobStatus;

/// Queue entry carrying a job to the worker for its active task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub task_id: TaskId,
    /// Execution location consumers select on
    pub location: String,
    /// Job status at enqueue time; `complete` asks the consumer to advance
    pub status: JobStatus,
    /// Serialized job snapshot
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn for_job(job: &Job, location: impl Into<String>) -> Result<Self, MessagingError> {
        let payload = job
            .to_snapshot()
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        Ok(Self {
            job_id: job.guid(),
            task_id: job.active_task_id().clone(),
            location: location.into(),
            status: job.status,
            payload,
            enqueued_at: Utc::now(),
        })
    }

    /// Same job routed to another location (e.g. a remote worker lane)
    pub fn rerouted(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn to_job(&self) -> Result<Job, MessagingError> {
        Job::from_snapshot(&self.payload)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}
