//! # Queue Transport Trait
//!
//! Provider-agnostic queue of [`JobMessage`]s shared by competing consumers.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobMessage, MessagingError, Selector};

/// Durable or in-memory job queue.
///
/// Implementations must:
///
/// - deliver each message to at most one `receive` caller
/// - list and consume messages in enqueue order
/// - make `remove_if_present` atomic with respect to `receive`, so exactly
///   one of them obtains a given message
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Publish a message
    async fn enqueue(&self, message: JobMessage) -> Result<(), MessagingError>;

    /// Non-destructive listing of matching messages, oldest first
    async fn browse(&self, selector: &Selector) -> Result<Vec<JobMessage>, MessagingError>;

    /// Consume the oldest matching message, waiting up to `wait` for one
    async fn receive(
        &self,
        selector: &Selector,
        wait: Duration,
    ) -> Result<Option<JobMessage>, MessagingError>;

    /// Consume the job's message without blocking; `true` when it was queued
    async fn remove_if_present(&self, job_id: Uuid) -> Result<bool, MessagingError>;

    async fn health_check(&self) -> Result<bool, MessagingError>;

    fn provider_name(&self) -> &'static str;
}
