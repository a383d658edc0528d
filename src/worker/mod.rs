//! # Worker
//!
//! Process-level entry points: the long-running worker that serves queue
//! locations, and the one-shot runner used on cluster nodes.

pub mod node;
pub mod process;

pub use node::{run_job_file, NodeOutcome};
pub use process::{shutdown_signal, WorkerProcess, WorkerProcessBuilder};
