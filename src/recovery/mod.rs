//! # Recovery
//!
//! Reconciles durable status records with the live queue when a worker
//! process starts, so jobs orphaned by a crash are picked up again.

pub mod coordinator;

pub use coordinator::{RecoveryCoordinator, RecoveryReport};
