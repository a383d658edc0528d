//! # Cluster Scheduler Protocol
//!
//! What the cluster engine needs from a batch scheduler: idempotent submit
//! keyed by job URI, status refresh, cancel, access to the job's output
//! files, and a stream of state-change callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::credential::ProxyCredential;
use super::description::ClusterJobDescription;
use super::fault::RemoteFault;
use super::ClusterError;

/// Scheduler-side identity of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub uri: String,
    pub remote_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "fault")]
pub enum RemoteState {
    Pending,
    Active,
    Done,
    Failed(RemoteFault),
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// State change pushed by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerCallback {
    pub uri: String,
    pub state: RemoteState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ClusterScheduler: Send + Sync + 'static {
    /// Submit under `uri`. Submitting a URI the scheduler already knows
    /// returns the existing handle.
    async fn submit(
        &self,
        uri: &str,
        description: &ClusterJobDescription,
        credential: &ProxyCredential,
    ) -> Result<RemoteHandle, ClusterError>;

    async fn find(&self, uri: &str) -> Result<Option<RemoteHandle>, ClusterError>;

    async fn refresh_status(&self, handle: &RemoteHandle) -> Result<RemoteState, ClusterError>;

    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), ClusterError>;

    /// Whether the job's stdout/stderr have been flushed back
    async fn output_ready(&self, handle: &RemoteHandle) -> Result<bool, ClusterError>;

    async fn fetch_output(&self, handle: &RemoteHandle) -> Result<ClusterOutput, ClusterError>;

    async fn remove_output(&self, handle: &RemoteHandle) -> Result<(), ClusterError>;

    /// Drop the scheduler's record of the job
    async fn release(&self, handle: &RemoteHandle) -> Result<(), ClusterError>;

    fn callbacks(&self) -> broadcast::Receiver<SchedulerCallback>;
}
