//! Cancellation tokens of tasks running in this process, keyed by job.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh token for a run of `job_id`, replacing any earlier one
    pub fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id, token.clone());
        token
    }

    /// Fire the job's token; `false` when nothing runs it here
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.tokens.remove(&job_id);
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.tokens.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
