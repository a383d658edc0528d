#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Job execution and queueing core for long-running background pipeline jobs.
//!
//! ## Overview
//!
//! A [`models::Job`] moves through an ordered pipeline of tasks. Each task
//! declares an execution location, which decides the kind of worker allowed to
//! run it: the in-process [`engines::LocalExecutionEngine`], a generic remote
//! server, or a batch cluster reached through [`engines::cluster`].
//!
//! ## Architecture
//!
//! ```text
//! JobService::submit
//!   -> StatusStore (durable StatusFile, conditional updates)
//!   -> QueueDispatcher -> QueueTransport (selectors per location)
//!        -> LocalExecutionEngine / RemoteEngineDispatcher
//!             -> JobRunner::run_active_task -> JobRunner::advance -> re-enqueue
//! WorkerProcess::start
//!   -> RecoveryCoordinator (per location, under LocationLock) -> consumers
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - Job, task identifiers and status records
//! - [`state_machine`] - Job status transitions
//! - [`pipeline`] - Task factories, pipeline registry and the job runner
//! - [`messaging`] - Queue transport, selectors and deferred publishing
//! - [`status`] - Status store, queue positions and location locks
//! - [`engines`] - Local, remote and cluster execution engines
//! - [`recovery`] - Startup requeue of orphaned jobs
//! - [`service`] - Dependency context and the public job API
//! - [`worker`] - Worker process lifecycle
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeline_core::config::PipelineConfig;
//! use pipeline_core::pipeline::TaskRegistry;
//! use pipeline_core::service::{JobService, PipelineContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TaskRegistry::new());
//! let context = PipelineContext::in_memory(PipelineConfig::default(), registry)?;
//! let service = JobService::new(Arc::new(context));
//! let positions = service.queue_positions("local").await?;
//! println!("{} jobs queued locally", positions.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engines;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod service;
pub mod state_machine;
pub mod status;
pub mod worker;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{PipelineError, Result};
pub use models::{Job, StatusFile, TaskId};
pub use service::{JobService, PipelineContext};
pub use state_machine::{JobEvent, JobStatus};
