//! # PostgreSQL Status Store
//!
//! Status records in `pipeline_status_files`. Conditional updates are a
//! single `UPDATE ... WHERE active_task_id = $expected AND status = ANY(...)`
//! so concurrent workers cannot overwrite each other's progress.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::{HostChange, StatusStore, StatusUpdate, UpdateOutcome};
use crate::error::{PipelineError, Result};
use crate::models::StatusFile;
use crate::state_machine::{JobStateMachine, JobStatus};

const COLUMNS: &str = "job_id, file_path, status, active_task_id, location, active_host_name, \
                       host_claimed_at, job_store, description, container, info, created_at, modified_at";

const IN_FLIGHT: &str = "(status IN ('waiting', 'running', 'cancelling') \
                         OR (status = 'complete' AND active_host_name IS NOT NULL))";

#[derive(Debug, sqlx::FromRow)]
struct StatusFileRow {
    job_id: Uuid,
    file_path: String,
    status: String,
    active_task_id: String,
    location: String,
    active_host_name: Option<String>,
    host_claimed_at: Option<DateTime<Utc>>,
    job_store: Option<String>,
    description: String,
    container: String,
    info: Option<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl TryFrom<StatusFileRow> for StatusFile {
    type Error = PipelineError;

    fn try_from(row: StatusFileRow) -> Result<Self> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: String| PipelineError::internal(format!("Invalid status in database: {e}")))?;
        Ok(StatusFile {
            job_id: row.job_id,
            file_path: row.file_path,
            status,
            active_task_id: row.active_task_id,
            location: row.location,
            active_host_name: row.active_host_name,
            host_claimed_at: row.host_claimed_at,
            job_store: row.job_store,
            description: row.description,
            container: row.container,
            info: row.info,
            created_at: row.created_at,
            modified_at: row.modified_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn host_change_parts(change: &HostChange) -> (&'static str, Option<&str>) {
    match change {
        HostChange::Keep => ("keep", None),
        HostChange::Set(host) => ("set", Some(host.as_str())),
        HostChange::Clear => ("clear", None),
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn get_status_file(&self, job_id: Uuid) -> Result<Option<StatusFile>> {
        let row = sqlx::query_as::<_, StatusFileRow>(&format!(
            "SELECT {COLUMNS} FROM pipeline_status_files WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StatusFile::try_from).transpose()
    }

    async fn get_status_file_by_path(&self, path: &str) -> Result<Option<StatusFile>> {
        let row = sqlx::query_as::<_, StatusFileRow>(&format!(
            "SELECT {COLUMNS} FROM pipeline_status_files WHERE file_path = $1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StatusFile::try_from).transpose()
    }

    #[instrument(skip(self, file), fields(job_id = %file.job_id))]
    async fn insert_or_replace(&self, file: StatusFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_status_files \
               (job_id, file_path, status, active_task_id, location, active_host_name, host_claimed_at, \
                job_store, description, container, info, created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (job_id) DO UPDATE SET \
               file_path = EXCLUDED.file_path, status = EXCLUDED.status, \
               active_task_id = EXCLUDED.active_task_id, location = EXCLUDED.location, \
               active_host_name = EXCLUDED.active_host_name, host_claimed_at = EXCLUDED.host_claimed_at, \
               job_store = EXCLUDED.job_store, description = EXCLUDED.description, \
               container = EXCLUDED.container, info = EXCLUDED.info, modified_at = EXCLUDED.modified_at",
        )
        .bind(file.job_id)
        .bind(&file.file_path)
        .bind(file.status.as_str())
        .bind(&file.active_task_id)
        .bind(&file.location)
        .bind(&file.active_host_name)
        .bind(file.host_claimed_at)
        .bind(&file.job_store)
        .bind(&file.description)
        .bind(&file.container)
        .bind(&file.info)
        .bind(file.created_at)
        .bind(file.modified_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PipelineError::duplicate_log_path(&file.file_path)
            }
            _ => PipelineError::from(e),
        })?;
        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %update.job_id, expected_task = %update.expected_task_id))]
    async fn update_status_file(&self, update: StatusUpdate) -> Result<UpdateOutcome> {
        let target = update.status.map(|s| s.as_str());
        let allowed_from: Vec<String> = update
            .status
            .map(|s| {
                JobStateMachine::allowed_predecessors(s)
                    .iter()
                    .map(|p| p.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let (next_task, next_location) = match &update.next_task {
            Some((task, location)) => (Some(task.as_str()), Some(location.as_str())),
            None => (None, None),
        };
        let (host_mode, host_name) = host_change_parts(&update.host);

        let row = sqlx::query_as::<_, StatusFileRow>(&format!(
            "UPDATE pipeline_status_files SET \
               status = COALESCE($3, status), \
               active_task_id = COALESCE($4, active_task_id), \
               location = COALESCE($5, location), \
               active_host_name = CASE $6 WHEN 'set' THEN $7 WHEN 'clear' THEN NULL ELSE active_host_name END, \
               host_claimed_at = CASE $6 WHEN 'set' THEN now() WHEN 'clear' THEN NULL ELSE host_claimed_at END, \
               job_store = COALESCE($8, job_store), \
               info = COALESCE($9, info), \
               modified_at = now() \
             WHERE job_id = $1 AND ($10 OR (active_task_id = $2 AND \
               ($3::text IS NULL OR status = $3 OR status = ANY($11)))) \
             RETURNING {COLUMNS}"
        ))
        .bind(update.job_id)
        .bind(&update.expected_task_id)
        .bind(target)
        .bind(next_task)
        .bind(next_location)
        .bind(host_mode)
        .bind(host_name)
        .bind(&update.job_store)
        .bind(&update.info)
        .bind(update.force)
        .bind(&allowed_from)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Applied(StatusFile::try_from(row)?));
        }
        match self.get_status_file(update.job_id).await? {
            Some(current) => {
                debug!(
                    current_status = %current.status,
                    current_task = %current.active_task_id,
                    "Stale status update ignored"
                );
                Ok(UpdateOutcome::Stale(current))
            }
            None => Ok(UpdateOutcome::NotFound),
        }
    }

    async fn status_files_for_location(
        &self,
        location: &str,
        active_only: bool,
    ) -> Result<Vec<StatusFile>> {
        let filter = if active_only { IN_FLIGHT } else { "TRUE" };
        let rows = sqlx::query_as::<_, StatusFileRow>(&format!(
            "SELECT {COLUMNS} FROM pipeline_status_files \
             WHERE location = $1 AND {filter} ORDER BY created_at"
        ))
        .bind(location)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StatusFile::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn claim_for_requeue(
        &self,
        job_id: Uuid,
        host: &str,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<StatusFile>> {
        let lease_seconds = lease_timeout.map(|d| d.as_secs_f64());
        let row = sqlx::query_as::<_, StatusFileRow>(&format!(
            "UPDATE pipeline_status_files SET \
               active_host_name = $2, host_claimed_at = now(), modified_at = now(), \
               status = CASE WHEN status = 'running' THEN 'waiting' ELSE status END \
             WHERE job_id = $1 AND {IN_FLIGHT} AND ( \
               active_host_name IS NULL OR active_host_name = $2 OR \
               ($3::double precision IS NOT NULL AND (host_claimed_at IS NULL OR \
                 host_claimed_at < now() - ($3::double precision * interval '1 second')))) \
             RETURNING {COLUMNS}"
        ))
        .bind(job_id)
        .bind(host)
        .bind(lease_seconds)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StatusFile::try_from).transpose()
    }

    async fn renew_host_lease(&self, job_id: Uuid, host: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_status_files SET host_claimed_at = now() \
             WHERE job_id = $1 AND active_host_name = $2",
        )
        .bind(job_id)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_status_file(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pipeline_status_files WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_container(&self, container: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pipeline_status_files WHERE container = $1")
            .bind(container)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, TaskId};

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_conditional_update_round_trip(pool: PgPool) {
        let store = PgStatusStore::new(pool);
        let job = Job::new(TaskId::new("import", "load"), "/c", "d", "/tmp/pg.log");
        let file = StatusFile::for_job(&job, "local").unwrap();
        store.insert_or_replace(file.clone()).await.unwrap();

        let applied = store
            .update_status_file(StatusUpdate::for_file(&file).status(JobStatus::Running).host("web1"))
            .await
            .unwrap();
        assert!(applied.is_applied());

        let stale = store
            .update_status_file(StatusUpdate::for_file(&file).status(JobStatus::Waiting))
            .await
            .unwrap();
        assert!(matches!(stale, UpdateOutcome::Stale(_)));

        let claimed = store
            .claim_for_requeue(file.job_id, "web1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Waiting);
        assert_eq!(
            store.status_files_for_location("local", true).await.unwrap().len(),
            1
        );
    }
}
