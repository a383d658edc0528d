//! # Status Store Trait
//!
//! Durable per-job status records. Every update names the task it was issued
//! for; the store applies it only while that task is still active and the
//! stored status may legally move to the requested one. Anything else is
//! reported as [`UpdateOutcome::Stale`] and changes nothing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Job, StatusFile, TaskId};
use crate::state_machine::{JobStateMachine, JobStatus};

/// Ownership change carried by an update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostChange {
    #[default]
    Keep,
    /// Take ownership and refresh the lease
    Set(String),
    Clear,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub job_id: Uuid,
    /// Task the update was issued for
    pub expected_task_id: String,
    pub status: Option<JobStatus>,
    /// New active task and its location (pipeline advance)
    pub next_task: Option<(String, String)>,
    pub host: HostChange,
    pub job_store: Option<String>,
    pub info: Option<String>,
    /// Skip the task and transition checks (administrative updates)
    pub force: bool,
}

impl StatusUpdate {
    pub fn for_task(job_id: Uuid, task_id: impl ToString) -> Self {
        Self {
            job_id,
            expected_task_id: task_id.to_string(),
            status: None,
            next_task: None,
            host: HostChange::Keep,
            job_store: None,
            info: None,
            force: false,
        }
    }

    pub fn for_job(job: &Job) -> Self {
        Self::for_task(job.guid(), job.active_task_id())
    }

    pub fn for_file(file: &StatusFile) -> Self {
        Self::for_task(file.job_id, &file.active_task_id)
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn advance_to(mut self, task_id: &TaskId, location: impl Into<String>) -> Self {
        self.next_task = Some((task_id.to_string(), location.into()));
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = HostChange::Set(host.into());
        self
    }

    pub fn clear_host(mut self) -> Self {
        self.host = HostChange::Clear;
        self
    }

    pub fn job_store(mut self, snapshot: impl Into<String>) -> Self {
        self.job_store = Some(snapshot.into());
        self
    }

    /// Store the job's current snapshot
    pub fn snapshot(self, job: &Job) -> Result<Self> {
        Ok(self.job_store(job.to_snapshot()?))
    }

    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Whether the update may apply to `current`
    pub fn applies_to(&self, current: &StatusFile) -> bool {
        if self.force {
            return true;
        }
        if current.active_task_id != self.expected_task_id {
            return false;
        }
        match self.status {
            Some(target) => JobStateMachine::can_transition(current.status, target),
            None => true,
        }
    }

    /// Resulting record, or `None` when the update is stale for `current`
    pub fn apply(&self, current: &StatusFile, now: DateTime<Utc>) -> Option<StatusFile> {
        if !self.applies_to(current) {
            return None;
        }
        let mut next = current.clone();
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some((task_id, location)) = &self.next_task {
            next.active_task_id = task_id.clone();
            next.location = location.clone();
        }
        match &self.host {
            HostChange::Keep => {}
            HostChange::Set(host) => {
                next.active_host_name = Some(host.clone());
                next.host_claimed_at = Some(now);
            }
            HostChange::Clear => {
                next.active_host_name = None;
                next.host_claimed_at = None;
            }
        }
        if let Some(job_store) = &self.job_store {
            next.job_store = Some(job_store.clone());
        }
        if let Some(info) = &self.info {
            next.info = Some(info.clone());
        }
        next.modified_at = now;
        Some(next)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(StatusFile),
    /// Stored task or status moved on; carries the current record
    Stale(StatusFile),
    NotFound,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn file(&self) -> Option<&StatusFile> {
        match self {
            Self::Applied(file) | Self::Stale(file) => Some(file),
            Self::NotFound => None,
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    async fn get_status_file(&self, job_id: Uuid) -> Result<Option<StatusFile>>;

    async fn get_status_file_by_path(&self, path: &str) -> Result<Option<StatusFile>>;

    async fn insert_or_replace(&self, file: StatusFile) -> Result<()>;

    /// Conditional update; see [`StatusUpdate::applies_to`]
    async fn update_status_file(&self, update: StatusUpdate) -> Result<UpdateOutcome>;

    /// Records at `location`, oldest first. `active_only` keeps in-flight ones.
    async fn status_files_for_location(
        &self,
        location: &str,
        active_only: bool,
    ) -> Result<Vec<StatusFile>>;

    /// Atomically take ownership of an in-flight record for requeue. Allowed
    /// when the record is unowned, owned by `host`, or its lease expired.
    /// A `running` record is reset to `waiting`; other statuses are kept.
    async fn claim_for_requeue(
        &self,
        job_id: Uuid,
        host: &str,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<StatusFile>>;

    /// Refresh the lease of a job owned by `host`
    async fn renew_host_lease(&self, job_id: Uuid, host: &str) -> Result<bool>;

    async fn delete_status_file(&self, job_id: Uuid) -> Result<bool>;

    /// Delete every record of a container, returning how many went
    async fn purge_container(&self, container: &str) -> Result<u64>;

    fn provider_name(&self) -> &'static str;
}
