//! # In-Memory Queue Transport
//!
//! Thread-safe FIFO queue for development and tests.
//!
//! ## Features
//!
//! - **Selective receive**: consumers take the oldest message matching their selector
//! - **Blocking wait**: `receive` parks on a `Notify` until a message arrives or the wait expires
//! - **Atomic removal**: `remove_if_present` and `receive` share one lock, so only one wins

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::messaging::{JobMessage, MessagingError, QueueTransport, Selector};

#[derive(Debug, Default)]
pub struct InMemoryQueueTransport {
    messages: Mutex<VecDeque<JobMessage>>,
    arrivals: Notify,
    total_enqueued: AtomicU64,
    total_received: AtomicU64,
    total_removed: AtomicU64,
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryQueueStats {
    pub depth: usize,
    pub total_enqueued: u64,
    pub total_received: u64,
    pub total_removed: u64,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn stats(&self) -> InMemoryQueueStats {
        InMemoryQueueStats {
            depth: self.len(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
        }
    }

    fn take_first(&self, selector: &Selector) -> Option<JobMessage> {
        let mut messages = self.messages.lock();
        let index = messages.iter().position(|m| selector.matches(m))?;
        let message = messages.remove(index);
        if message.is_some() {
            self.total_received.fetch_add(1, Ordering::Relaxed);
        }
        message
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn enqueue(&self, message: JobMessage) -> Result<(), MessagingError> {
        self.messages.lock().push_back(message);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn browse(&self, selector: &Selector) -> Result<Vec<JobMessage>, MessagingError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| selector.matches(m))
            .cloned()
            .collect())
    }

    async fn receive(
        &self,
        selector: &Selector,
        wait: Duration,
    ) -> Result<Option<JobMessage>, MessagingError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so an enqueue between the
            // check and the await is not missed
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.take_first(selector) {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(self.take_first(selector));
            }
        }
    }

    async fn remove_if_present(&self, job_id: Uuid) -> Result<bool, MessagingError> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.job_id != job_id);
        let removed = before - messages.len();
        if removed > 0 {
            self.total_removed.fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(removed > 0)
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
