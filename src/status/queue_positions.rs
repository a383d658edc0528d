//! # Queue Positions
//!
//! 1-based positions of queued jobs per location, computed from a transport
//! browse and cached for a short wall-clock TTL so status pages polling many
//! jobs do not rescan the queue each time. A remote location's worker lane
//! counts as part of that location's queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::constants::locations::worker_lane;
use crate::messaging::{JobMessage, MessagingError, QueueTransport, Selector};

#[derive(Debug, Clone)]
struct CachedPositions {
    computed_at: Instant,
    positions: Arc<HashMap<Uuid, usize>>,
}

#[derive(Debug)]
pub struct QueuePositionCache {
    ttl: Duration,
    entries: DashMap<String, CachedPositions>,
}

impl QueuePositionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Positions of every job queued at `location`
    pub async fn positions(
        &self,
        location: &str,
        transport: &dyn QueueTransport,
    ) -> Result<Arc<HashMap<Uuid, usize>>, MessagingError> {
        if let Some(cached) = self.entries.get(location) {
            if cached.computed_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.positions));
            }
        }

        let selector = Selector::location(location).or(Selector::location(worker_lane(location)));
        let queued = transport.browse(&selector).await?;
        let positions = Arc::new(compute_positions(&queued));
        debug!(location = %location, queued = positions.len(), "Queue positions recomputed");
        self.entries.insert(
            location.to_string(),
            CachedPositions {
                computed_at: Instant::now(),
                positions: Arc::clone(&positions),
            },
        );
        Ok(positions)
    }

    pub async fn position_of(
        &self,
        location: &str,
        job_id: Uuid,
        transport: &dyn QueueTransport,
    ) -> Result<Option<usize>, MessagingError> {
        Ok(self.positions(location, transport).await?.get(&job_id).copied())
    }

    pub fn invalidate(&self, location: &str) {
        self.entries.remove(location);
    }
}

/// 1-based contiguous positions in enqueue order; a job queued twice keeps
/// its first position.
pub fn compute_positions(queued: &[JobMessage]) -> HashMap<Uuid, usize> {
    let mut positions = HashMap::with_capacity(queued.len());
    for message in queued {
        let next = positions.len() + 1;
        positions.entry(message.job_id).or_insert(next);
    }
    positions
}
