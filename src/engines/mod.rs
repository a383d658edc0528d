//! # Execution Engines
//!
//! Where a task's body actually runs.
//!
//! ```text
//! location ─┬─ local           -> LocalExecutionEngine (in process)
//!           ├─ remote server   -> RemoteEngineDispatcher + QueueRemoteEngine
//!           └─ cluster         -> RemoteEngineDispatcher + ClusterExecutionEngine
//! ```

pub mod cluster;
pub mod local;
pub mod queue_remote;
pub mod remote;

pub use cluster::{ClusterError, ClusterExecutionEngine};
pub use local::LocalExecutionEngine;
pub use queue_remote::QueueRemoteEngine;
pub use remote::{RemoteEngineDispatcher, RemoteEngineError, RemoteExecutionEngine, RemoteRecovery};
