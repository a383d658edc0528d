//! # PostgreSQL Queue Transport
//!
//! Durable job queue on the `pipeline_job_queue` table. Consumers claim rows
//! with `FOR UPDATE SKIP LOCKED`, so competing workers never block each other
//! and a row is delivered to exactly one of them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::messaging::{JobMessage, MessagingError, QueueTransport, Selector};

const RETURNING_COLUMNS: &str = "job_id, task_id, location, status, payload, enqueued_at";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    job_id: Uuid,
    task_id: String,
    location: String,
    status: String,
    payload: String,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for JobMessage {
    type Error = MessagingError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(JobMessage {
            job_id: row.job_id,
            task_id: row
                .task_id
                .parse()
                .map_err(|e: crate::models::ParseTaskIdError| {
                    MessagingError::message_deserialization(e.to_string())
                })?,
            location: row.location,
            status: row
                .status
                .parse()
                .map_err(MessagingError::message_deserialization)?,
            payload: row.payload,
            enqueued_at: row.enqueued_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgQueueTransport {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgQueueTransport {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    async fn try_claim(&self, selector: &Selector) -> Result<Option<JobMessage>, MessagingError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "DELETE FROM pipeline_job_queue WHERE msg_id = (SELECT msg_id FROM pipeline_job_queue WHERE ",
        );
        selector.push_sql(&mut builder);
        builder.push(" ORDER BY msg_id FOR UPDATE SKIP LOCKED LIMIT 1) RETURNING ");
        builder.push(RETURNING_COLUMNS);

        let row = builder
            .build_query_as::<QueueRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MessagingError::database_query("receive", e.to_string()))?;

        row.map(JobMessage::try_from).transpose()
    }
}

#[async_trait]
impl QueueTransport for PgQueueTransport {
    #[instrument(skip(self, message), fields(job_id = %message.job_id, location = %message.location))]
    async fn enqueue(&self, message: JobMessage) -> Result<(), MessagingError> {
        sqlx::query(
            "INSERT INTO pipeline_job_queue (job_id, task_id, location, status, payload, enqueued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.job_id)
        .bind(message.task_id.to_string())
        .bind(&message.location)
        .bind(message.status.as_str())
        .bind(&message.payload)
        .bind(message.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("enqueue", e.to_string()))?;
        Ok(())
    }

    async fn browse(&self, selector: &Selector) -> Result<Vec<JobMessage>, MessagingError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder.push(RETURNING_COLUMNS);
        builder.push(" FROM pipeline_job_queue WHERE ");
        selector.push_sql(&mut builder);
        builder.push(" ORDER BY msg_id");

        let rows = builder
            .build_query_as::<QueueRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MessagingError::database_query("browse", e.to_string()))?;

        rows.into_iter().map(JobMessage::try_from).collect()
    }

    #[instrument(skip(self), fields(selector = %selector))]
    async fn receive(
        &self,
        selector: &Selector,
        wait: Duration,
    ) -> Result<Option<JobMessage>, MessagingError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.try_claim(selector).await? {
                debug!(job_id = %message.job_id, "Claimed queue message");
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn remove_if_present(&self, job_id: Uuid) -> Result<bool, MessagingError> {
        // Rows locked by a consumer mid-claim are skipped: the consumer wins
        let result = sqlx::query(
            "DELETE FROM pipeline_job_queue WHERE msg_id IN \
             (SELECT msg_id FROM pipeline_job_queue WHERE job_id = $1 FOR UPDATE SKIP LOCKED)",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("remove_if_present", e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|value| value == 1)
            .map_err(|e| MessagingError::database_query("health_check", e.to_string()))
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}
