use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{Job, TaskId};
use crate::state_machine::JobStatus;

/// Durable status record of a job, keyed by job ID and by log file path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFile {
    pub job_id: Uuid,
    /// Log file path of the job; secondary durable key
    pub file_path: String,
    pub status: JobStatus,
    pub active_task_id: String,
    /// Execution location of the active task
    pub location: String,
    /// Host that currently owns the job; `None` while nobody does
    pub active_host_name: Option<String>,
    /// Last time the owning host claimed or renewed the job
    pub host_claimed_at: Option<DateTime<Utc>>,
    /// Serialized job snapshot
    pub job_store: Option<String>,
    pub description: String,
    pub container: String,
    /// Last info or error message
    pub info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl StatusFile {
    /// Fresh `waiting` record for a job about to be queued at `location`
    pub fn for_job(job: &Job, location: &str) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            job_id: job.guid(),
            file_path: job.log_file_path().to_string_lossy().into_owned(),
            status: JobStatus::Waiting,
            active_task_id: job.active_task_id().to_string(),
            location: location.to_string(),
            active_host_name: None,
            host_claimed_at: None,
            job_store: Some(job.to_snapshot()?),
            description: job.description.clone(),
            container: job.container.clone(),
            info: None,
            created_at: now,
            modified_at: now,
        })
    }

    /// Still needs a worker: queued, executing, stopping, or complete with
    /// the advance to the next task not yet recorded
    pub fn is_in_flight(&self) -> bool {
        self.status.is_active()
            || (self.status == JobStatus::Complete && self.active_host_name.is_some())
    }

    /// Whether another host may take the job over. Without a timeout the
    /// owner is never considered dead.
    pub fn host_lease_expired(&self, now: DateTime<Utc>, timeout: Option<Duration>) -> bool {
        let Some(timeout) = timeout else {
            return false;
        };
        match self.host_claimed_at {
            None => true,
            Some(claimed_at) => chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|timeout| claimed_at.checked_add_signed(timeout))
                .is_some_and(|deadline| deadline < now),
        }
    }

    /// Whether `host` may requeue this job
    pub fn claimable_by(&self, host: &str, now: DateTime<Utc>, lease: Option<Duration>) -> bool {
        match self.active_host_name.as_deref() {
            None => true,
            Some(owner) if owner == host => true,
            Some(_) => self.host_lease_expired(now, lease),
        }
    }

    pub fn task_id(&self) -> Result<TaskId> {
        self.active_task_id
            .parse()
            .map_err(|_| PipelineError::unknown_task(&self.active_task_id))
    }

    /// Deserialize the stored job snapshot
    pub fn restore_job(&self) -> Result<Job> {
        let data = self.job_store.as_deref().ok_or_else(|| {
            PipelineError::invalid_snapshot(format!("status file for job {} has no snapshot", self.job_id))
        })?;
        Job::from_snapshot(data)
    }
}
