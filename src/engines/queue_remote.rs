//! # Queue-Backed Remote Engine
//!
//! Generic remote server engine: jobs for a remote location are forwarded to
//! that location's worker lane (`<location>:worker`) on the shared queue,
//! where worker processes running elsewhere consume them with a local
//! engine. Status and cancellation go through the shared status store; the
//! remote worker's heartbeat notices a `cancelling` record and stops the task.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::remote::{RemoteExecutionEngine, RemoteRecovery};
use crate::constants::locations::worker_lane;
use crate::error::{PipelineError, Result};
use crate::messaging::{JobMessage, Selector};
use crate::models::{Job, StatusFile};
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;
use crate::status::StatusUpdate;

pub struct QueueRemoteEngine {
    location: String,
    lane: String,
    context: Arc<PipelineContext>,
}

impl std::fmt::Debug for QueueRemoteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRemoteEngine")
            .field("location", &self.location)
            .field("lane", &self.lane)
            .finish()
    }
}

impl QueueRemoteEngine {
    pub fn new(context: Arc<PipelineContext>, location: impl Into<String>) -> Self {
        let location = location.into();
        Self {
            lane: worker_lane(&location),
            location,
            context,
        }
    }

    /// Queue location remote workers consume
    pub fn lane(&self) -> &str {
        &self.lane
    }

    async fn queued_in_lane(&self, job_id: Uuid) -> Result<bool> {
        let selector = Selector::location(&self.lane).and(Selector::job(job_id));
        Ok(!self.context.transport().browse(&selector).await?.is_empty())
    }
}

#[async_trait]
impl RemoteExecutionEngine for QueueRemoteEngine {
    fn engine_type(&self) -> &'static str {
        "queue_remote"
    }

    fn location(&self) -> &str {
        &self.location
    }

    #[instrument(skip(self, job), fields(job_id = %job.guid(), lane = %self.lane))]
    async fn submit_job(&self, job: Job) -> Result<()> {
        let message = JobMessage::for_job(&job, &self.lane)?;
        self.context.transport().enqueue(message).await?;
        debug!("Forwarded to remote worker lane");
        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        Ok(self
            .context
            .store()
            .get_status_file(job_id)
            .await?
            .map(|file| file.status))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        if self.context.transport().remove_if_present(job_id).await? {
            let file = self
                .context
                .store()
                .get_status_file(job_id)
                .await?
                .ok_or_else(|| PipelineError::job_not_found(job_id))?;
            let outcome = self
                .context
                .store()
                .update_status_file(
                    StatusUpdate::for_file(&file)
                        .status(JobStatus::Cancelled)
                        .clear_host()
                        .info("Cancelled"),
                )
                .await?;
            info!(job_id = %job_id, applied = outcome.is_applied(), "Removed job from remote worker lane");
            return Ok(true);
        }
        // The owning worker watches the store for `cancelling`
        Ok(self.context.store().get_status_file(job_id).await?.is_some())
    }

    async fn update_status_for_jobs(&self, job_ids: &[Uuid]) -> Result<()> {
        for &job_id in job_ids {
            let Some(file) = self.context.store().get_status_file(job_id).await? else {
                continue;
            };
            // A cancel that reached neither the lane nor a running worker
            if file.status == JobStatus::Cancelling
                && file.active_host_name.is_none()
                && !self.queued_in_lane(job_id).await?
            {
                self.context
                    .store()
                    .update_status_file(
                        StatusUpdate::for_file(&file)
                            .status(JobStatus::Cancelled)
                            .info("Cancelled"),
                    )
                    .await?;
                info!(job_id = %job_id, "Orphaned cancellation confirmed");
            }
        }
        Ok(())
    }

    async fn recover_job(&self, file: &StatusFile) -> Result<RemoteRecovery> {
        if file.status.is_terminal() {
            return Ok(RemoteRecovery::Finished);
        }
        if self.queued_in_lane(file.job_id).await? {
            return Ok(RemoteRecovery::StillRunning);
        }
        Ok(RemoteRecovery::Unknown)
    }
}
