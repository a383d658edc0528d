//! # Queue Transport Providers

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryQueueStats, InMemoryQueueTransport};
pub use postgres::PgQueueTransport;
