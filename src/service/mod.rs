//! # Service
//!
//! Process-wide dependencies and the public job API.

pub mod cancellation;
pub mod context;
pub mod job_service;

pub use cancellation::CancellationRegistry;
pub use context::{PipelineContext, MIGRATOR};
pub use job_service::JobService;
