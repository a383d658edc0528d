//! # Messaging
//!
//! Queue transport for job messages.
//!
//! ## Architecture
//!
//! ```text
//! QueueDispatcher            <- publish / consume_scope (deferred outbound)
//!   └── Arc<dyn QueueTransport>
//!         ├── InMemoryQueueTransport   (development, tests)
//!         └── PgQueueTransport         (pipeline_job_queue, SKIP LOCKED)
//! Selector                   <- location / task / job predicates
//! ```

pub mod errors;
pub mod message;
pub mod outbound;
pub mod providers;
pub mod selector;
pub mod transport;

pub use errors::MessagingError;
pub use message::JobMessage;
pub use outbound::QueueDispatcher;
pub use providers::{InMemoryQueueTransport, PgQueueTransport};
pub use selector::Selector;
pub use transport::QueueTransport;
