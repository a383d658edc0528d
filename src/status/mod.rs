//! # Status
//!
//! Durable job status records, queue positions and per-location locking.
//!
//! ```text
//! Arc<dyn StatusStore>
//!   ├── InMemoryStatusStore   (DashMap)
//!   └── PgStatusStore         (pipeline_status_files)
//! QueuePositionCache          <- browse + TTL cache per location
//! Arc<dyn LocationLock>
//!   ├── InMemoryLocationLock  (tokio mutex per location)
//!   └── PgLocationLock        (pg_advisory_xact_lock)
//! ```

pub mod in_memory;
pub mod location_lock;
pub mod postgres;
pub mod queue_positions;
pub mod store;

pub use in_memory::InMemoryStatusStore;
pub use location_lock::{InMemoryLocationLock, LocationLock, LocationLockGuard, PgLocationLock};
pub use postgres::PgStatusStore;
pub use queue_positions::{compute_positions, QueuePositionCache};
pub use store::{HostChange, StatusStore, StatusUpdate, UpdateOutcome};
