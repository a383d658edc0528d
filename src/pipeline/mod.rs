//! # Task Pipeline
//!
//! Jobs move through an ordered list of tasks. Each task names the execution
//! location that may run it; a task's completion advances the job to the next
//! task and re-queues it for that location.
//!
//! ```text
//! TaskRegistry  <- pipelines: ordered TaskFactory lists
//! TaskFactory   <- location, retry, cluster overrides, create_task
//! Task          <- run(&mut Job, &TaskContext)
//! CommandTask   <- configured stages running an external program
//! JobRunner     <- run_active_task / advance / confirm_cancel / mark_error
//! ```

pub mod command;
pub mod factory;
pub mod registry;
pub mod runner;
pub mod task;

pub use command::{command_stage, CommandTask};
pub use factory::{FnTaskFactory, ResourceOverrides, TaskFactory};
pub use registry::TaskRegistry;
pub use runner::{AdvanceOutcome, JobRunner, RunOutcome};
pub use task::{Task, TaskContext, TaskError};
