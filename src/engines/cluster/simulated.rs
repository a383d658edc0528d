//! # Simulated Cluster Scheduler
//!
//! In-memory scheduler for development and tests. Jobs sit in `pending`
//! until driven with [`SimulatedClusterScheduler::set_state`]; every state
//! change is broadcast as a callback, like a real scheduler would push it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::credential::ProxyCredential;
use super::description::ClusterJobDescription;
use super::fault::RemoteFault;
use super::scheduler::{ClusterOutput, ClusterScheduler, RemoteHandle, RemoteState, SchedulerCallback};
use super::ClusterError;

#[derive(Debug, Clone)]
struct SimulatedJob {
    handle: RemoteHandle,
    description: ClusterJobDescription,
    state: RemoteState,
    output: Option<ClusterOutput>,
}

#[derive(Debug)]
pub struct SimulatedClusterScheduler {
    jobs: DashMap<String, SimulatedJob>,
    callbacks: broadcast::Sender<SchedulerCallback>,
    next_submit_failure: Mutex<Option<RemoteFault>>,
    /// Output becomes ready as soon as a job turns terminal
    auto_output: bool,
}

impl Default for SimulatedClusterScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClusterScheduler {
    pub fn new() -> Self {
        let (callbacks, _) = broadcast::channel(256);
        Self {
            jobs: DashMap::new(),
            callbacks,
            next_submit_failure: Mutex::new(None),
            auto_output: true,
        }
    }

    /// Output stays missing until [`Self::set_output`] is called
    pub fn with_manual_output(mut self) -> Self {
        self.auto_output = false;
        self
    }

    pub fn fail_next_submit(&self, fault: RemoteFault) {
        *self.next_submit_failure.lock() = Some(fault);
    }

    /// Move a job to `state` and broadcast the change
    pub fn set_state(&self, uri: &str, state: RemoteState) -> bool {
        let Some(mut job) = self.jobs.get_mut(uri) else {
            return false;
        };
        job.state = state.clone();
        if self.auto_output && state.is_terminal() && job.output.is_none() {
            job.output = Some(ClusterOutput::default());
        }
        drop(job);
        debug!(uri = %uri, state = ?state, "Simulated scheduler state change");
        // No receivers is fine: nobody listens yet
        let _ = self.callbacks.send(SchedulerCallback {
            uri: uri.to_string(),
            state,
        });
        true
    }

    pub fn set_output(&self, uri: &str, stdout: impl Into<String>, stderr: impl Into<String>) {
        if let Some(mut job) = self.jobs.get_mut(uri) {
            job.output = Some(ClusterOutput {
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
        }
    }

    pub fn state(&self, uri: &str) -> Option<RemoteState> {
        self.jobs.get(uri).map(|job| job.state.clone())
    }

    pub fn description(&self, uri: &str) -> Option<ClusterJobDescription> {
        self.jobs.get(uri).map(|job| job.description.clone())
    }

    pub fn submitted(&self) -> usize {
        self.jobs.len()
    }

    fn get(&self, handle: &RemoteHandle) -> Result<SimulatedJob, ClusterError> {
        self.jobs
            .get(&handle.uri)
            .map(|job| job.clone())
            .ok_or_else(|| ClusterError::unknown_job(&handle.uri))
    }
}

#[async_trait]
impl ClusterScheduler for SimulatedClusterScheduler {
    async fn submit(
        &self,
        uri: &str,
        description: &ClusterJobDescription,
        _credential: &ProxyCredential,
    ) -> Result<RemoteHandle, ClusterError> {
        if let Some(fault) = self.next_submit_failure.lock().take() {
            return Err(ClusterError::Fault(fault));
        }
        let job = self
            .jobs
            .entry(uri.to_string())
            .or_insert_with(|| SimulatedJob {
                handle: RemoteHandle {
                    uri: uri.to_string(),
                    remote_id: Uuid::new_v4().to_string(),
                    endpoint: description.endpoint.clone(),
                },
                description: description.clone(),
                state: RemoteState::Pending,
                output: None,
            });
        Ok(job.handle.clone())
    }

    async fn find(&self, uri: &str) -> Result<Option<RemoteHandle>, ClusterError> {
        Ok(self.jobs.get(uri).map(|job| job.handle.clone()))
    }

    async fn refresh_status(&self, handle: &RemoteHandle) -> Result<RemoteState, ClusterError> {
        Ok(self.get(handle)?.state)
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), ClusterError> {
        let job = self.get(handle)?;
        if !job.state.is_terminal() {
            self.set_state(&handle.uri, RemoteState::Failed(RemoteFault::user_cancelled()));
        }
        Ok(())
    }

    async fn output_ready(&self, handle: &RemoteHandle) -> Result<bool, ClusterError> {
        Ok(self.get(handle)?.output.is_some())
    }

    async fn fetch_output(&self, handle: &RemoteHandle) -> Result<ClusterOutput, ClusterError> {
        self.get(handle)?
            .output
            .ok_or_else(|| ClusterError::scheduler("fetch_output", "output not ready"))
    }

    async fn remove_output(&self, handle: &RemoteHandle) -> Result<(), ClusterError> {
        if let Some(mut job) = self.jobs.get_mut(&handle.uri) {
            job.output = None;
        }
        Ok(())
    }

    async fn release(&self, handle: &RemoteHandle) -> Result<(), ClusterError> {
        self.jobs.remove(&handle.uri);
        Ok(())
    }

    fn callbacks(&self) -> broadcast::Receiver<SchedulerCallback> {
        self.callbacks.subscribe()
    }
}
