//! # Models
//!
//! Job representation and the durable status record.

pub mod job;
pub mod status_file;
pub mod task_id;

pub use job::{Job, LogEntry, LogLevel};
pub use status_file::StatusFile;
pub use task_id::{ParseTaskIdError, TaskId};
