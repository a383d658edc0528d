//! # Deferred Publishing
//!
//! A consumer that publishes while it is still handling a message (advancing
//! a job to its next task, for example) must not have that publish race the
//! end of its own handler. [`QueueDispatcher::consume_scope`] installs a
//! task-local outbound buffer; [`QueueDispatcher::publish`] calls made inside
//! the scope land in the buffer and are flushed after the handler returns.
//! Outside a scope, publishing goes straight to the transport.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{JobMessage, MessagingError, QueueTransport};
use crate::logging::log_queue_operation;

tokio::task_local! {
    static OUTBOUND: RefCell<Vec<JobMessage>>;
}

pub struct QueueDispatcher {
    transport: Arc<dyn QueueTransport>,
}

impl std::fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("transport", &self.transport.provider_name())
            .finish()
    }
}

impl QueueDispatcher {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Whether the current task is inside a consume scope
    pub fn in_consume_scope() -> bool {
        OUTBOUND.try_with(|_| ()).is_ok()
    }

    /// Publish now, or defer until the enclosing consume scope ends
    pub async fn publish(&self, message: JobMessage) -> Result<(), MessagingError> {
        let mut slot = Some(message);
        // try_with only runs the closure inside a scope; otherwise slot keeps the message
        let _ = OUTBOUND.try_with(|buffer| {
            if let Some(message) = slot.take() {
                buffer.borrow_mut().push(message);
            }
        });

        match slot {
            Some(message) => {
                log_queue_operation(
                    "enqueue",
                    Some(&message.location),
                    Some(message.job_id),
                    "published",
                    None,
                );
                self.transport.enqueue(message).await
            }
            None => {
                debug!("Outbound message buffered until consume completes");
                Ok(())
            }
        }
    }

    /// Run `handler` with publishing deferred, then flush what it published.
    /// Every buffered message is attempted; the first flush error is returned.
    pub async fn consume_scope<F, T>(&self, handler: F) -> Result<T, MessagingError>
    where
        F: Future<Output = T>,
    {
        let (output, pending) = OUTBOUND
            .scope(RefCell::new(Vec::new()), async move {
                let output = handler.await;
                let pending = OUTBOUND.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()));
                (output, pending)
            })
            .await;

        let mut first_error = None;
        for message in pending {
            let job_id = message.job_id;
            let location = message.location.clone();
            if let Err(e) = self.transport.enqueue(message).await {
                warn!(job_id = %job_id, location = %location, error = %e, "Failed to flush deferred message");
                first_error.get_or_insert(e);
            } else {
                log_queue_operation("enqueue", Some(&location), Some(job_id), "flushed", None);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(output),
        }
    }
}
