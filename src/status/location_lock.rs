//! # Location Lock
//!
//! Serializes recovery sweeps per execution location. The in-memory flavor
//! guards a single process; the PostgreSQL flavor takes a transaction-scoped
//! advisory lock so sweeps on different hosts exclude each other too.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::constants::LOCATION_LOCK_NAMESPACE;
use crate::error::Result;

enum GuardInner {
    Local(OwnedMutexGuard<()>),
    Postgres(Transaction<'static, Postgres>),
}

/// Held lock on one location; dropping it also releases the lock
pub struct LocationLockGuard {
    location: String,
    inner: GuardInner,
}

impl std::fmt::Debug for LocationLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            GuardInner::Local(_) => "local",
            GuardInner::Postgres(_) => "postgres",
        };
        f.debug_struct("LocationLockGuard")
            .field("location", &self.location)
            .field("kind", &kind)
            .finish()
    }
}

impl LocationLockGuard {
    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn release(self) -> Result<()> {
        match self.inner {
            GuardInner::Local(guard) => drop(guard),
            GuardInner::Postgres(tx) => tx.commit().await?,
        }
        debug!(location = %self.location, "Location lock released");
        Ok(())
    }
}

#[async_trait]
pub trait LocationLock: Send + Sync + 'static {
    /// Wait for exclusive ownership of `location`
    async fn acquire(&self, location: &str) -> Result<LocationLockGuard>;
}

#[derive(Debug, Default)]
pub struct InMemoryLocationLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InMemoryLocationLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationLock for InMemoryLocationLock {
    async fn acquire(&self, location: &str) -> Result<LocationLockGuard> {
        let mutex = Arc::clone(
            self.locks
                .entry(location.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;
        debug!(location = %location, "Location lock acquired");
        Ok(LocationLockGuard {
            location: location.to_string(),
            inner: GuardInner::Local(guard),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgLocationLock {
    pool: PgPool,
}

impl PgLocationLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocationLock for PgLocationLock {
    async fn acquire(&self, location: &str) -> Result<LocationLockGuard> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(LOCATION_LOCK_NAMESPACE)
            .bind(location)
            .execute(&mut *tx)
            .await?;
        debug!(location = %location, "Advisory location lock acquired");
        Ok(LocationLockGuard {
            location: location.to_string(),
            inner: GuardInner::Postgres(tx),
        })
    }
}
