//! # Recovery Coordinator
//!
//! Startup sweep that requeues jobs whose worker died mid-task.
//!
//! ```text
//! recover_location(loc)           [under LocationLock(loc)]
//!   live = browse(loc) ∪ browse(loc:worker)
//!   for each in-flight StatusFile at loc:
//!     live                      -> leave alone
//!     owned by a live host      -> skip
//!     remote engine knows it    -> still running / finished
//!     claim_for_requeue
//!       cancelling              -> cancelled
//!       complete                -> advance
//!       waiting (running reset) -> re-enqueue snapshot
//!       unreadable snapshot     -> error
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::locations::worker_lane;
use crate::engines::RemoteRecovery;
use crate::error::Result;
use crate::messaging::{JobMessage, Selector};
use crate::models::StatusFile;
use crate::pipeline::AdvanceOutcome;
use crate::service::PipelineContext;
use crate::state_machine::JobStatus;
use crate::status::StatusUpdate;

/// What one sweep of a location did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub location: String,
    /// In-flight records looked at
    pub examined: usize,
    /// Already on the queue
    pub live: usize,
    pub requeued: usize,
    /// Records that could not be restored and were marked `error`
    pub errored: usize,
    /// Owned by another host with a live lease, or claimed by someone else
    pub skipped: usize,
    /// Still queued or running on a remote engine
    pub still_running: usize,
    /// Settled during the sweep (cancel confirmed, advance finished, remote outcome recorded)
    pub finalized: usize,
}

impl RecoveryReport {
    fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            ..Self::default()
        }
    }

    /// Records that needed action
    pub fn recovered(&self) -> usize {
        self.requeued + self.errored + self.finalized
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    context: Arc<PipelineContext>,
}

impl RecoveryCoordinator {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        Self { context }
    }

    /// Sweep every location in turn
    pub async fn recover_locations(&self, locations: &[String]) -> Result<Vec<RecoveryReport>> {
        let mut reports = Vec::with_capacity(locations.len());
        for location in locations {
            reports.push(self.recover_location(location).await?);
        }
        Ok(reports)
    }

    /// Requeue orphaned jobs at `location`
    #[instrument(skip(self))]
    pub async fn recover_location(&self, location: &str) -> Result<RecoveryReport> {
        let guard = self.context.location_lock().acquire(location).await?;
        let swept = self.sweep(location).await;
        guard.release().await?;
        let report = swept?;

        if report.recovered() > 0 {
            info!(
                location = %location,
                examined = report.examined,
                requeued = report.requeued,
                errored = report.errored,
                finalized = report.finalized,
                "📦 Recovery sweep requeued orphaned jobs"
            );
        } else {
            debug!(location = %location, examined = report.examined, "Recovery sweep found nothing to do");
        }
        Ok(report)
    }

    async fn live_jobs(&self, location: &str) -> Result<HashSet<Uuid>> {
        let selector = Selector::location(location).or(Selector::location(worker_lane(location)));
        Ok(self
            .context
            .transport()
            .browse(&selector)
            .await?
            .into_iter()
            .map(|message| message.job_id)
            .collect())
    }

    async fn sweep(&self, location: &str) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::new(location);
        let live = self.live_jobs(location).await?;
        let files = self
            .context
            .store()
            .status_files_for_location(location, true)
            .await?;
        let host = self.context.host_name();
        let lease = self.context.config().recovery.host_lease_timeout();
        let engine = self.context.remote_engine(location);

        for file in files {
            report.examined += 1;
            if live.contains(&file.job_id) {
                report.live += 1;
                continue;
            }
            if !file.claimable_by(host, Utc::now(), lease) {
                debug!(job_id = %file.job_id, owner = ?file.active_host_name, "Owned by a live host");
                report.skipped += 1;
                continue;
            }

            if let Some(engine) = &engine {
                match engine.recover_job(&file).await {
                    Ok(RemoteRecovery::StillRunning) => {
                        report.still_running += 1;
                        continue;
                    }
                    Ok(RemoteRecovery::Finished) => {
                        report.finalized += 1;
                        continue;
                    }
                    Ok(RemoteRecovery::Unknown) => {}
                    Err(e) => {
                        warn!(job_id = %file.job_id, error = %e, "Remote recovery check failed; requeueing");
                    }
                }
            }

            let Some(claimed) = self
                .context
                .store()
                .claim_for_requeue(file.job_id, host, lease)
                .await?
            else {
                report.skipped += 1;
                continue;
            };
            self.resume(claimed, &mut report).await?;
        }
        Ok(report)
    }

    async fn resume(&self, claimed: StatusFile, report: &mut RecoveryReport) -> Result<()> {
        let job_id = claimed.job_id;
        if claimed.status == JobStatus::Cancelling {
            let update = StatusUpdate::for_file(&claimed)
                .status(JobStatus::Cancelled)
                .clear_host()
                .info("Cancelled during recovery");
            self.context.store().update_status_file(update).await?;
            report.finalized += 1;
            return Ok(());
        }

        let mut job = match claimed.restore_job() {
            Ok(job) => job,
            Err(e) => {
                let message = format!("Job could not be restored during recovery: {e}");
                warn!(job_id = %job_id, error = %e, "Unreadable job snapshot");
                let update = StatusUpdate::for_file(&claimed)
                    .status(JobStatus::Error)
                    .clear_host()
                    .info(message)
                    .forced();
                self.context.store().update_status_file(update).await?;
                report.errored += 1;
                return Ok(());
            }
        };

        if claimed.status == JobStatus::Complete {
            job.status = JobStatus::Complete;
            match self.context.runner().advance(&mut job).await? {
                AdvanceOutcome::Enqueued(next) => {
                    debug!(job_id = %job_id, next_task = %next, "Lost advance recovered");
                    report.requeued += 1;
                }
                AdvanceOutcome::Finished | AdvanceOutcome::Duplicate => report.finalized += 1,
            }
            return Ok(());
        }

        job.status = JobStatus::Waiting;
        job.info(format!("Requeued by recovery on {}", self.context.host_name()));
        let message = JobMessage::for_job(&job, &claimed.location)?;
        if let Err(e) = self.context.dispatcher().publish(message).await {
            warn!(job_id = %job_id, error = %e, "Requeue failed");
            let update = StatusUpdate::for_file(&claimed)
                .status(JobStatus::Error)
                .clear_host()
                .info(format!("Failed to requeue job: {e}"))
                .forced();
            self.context.store().update_status_file(update).await?;
            report.errored += 1;
            return Ok(());
        }
        debug!(job_id = %job_id, location = %claimed.location, "Job requeued");
        report.requeued += 1;
        Ok(())
    }
}
