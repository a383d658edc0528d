//! # In-Memory Status Store
//!
//! `DashMap`-backed store for development and tests. Updates to one job are
//! atomic because they run under that entry's shard lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::store::{StatusStore, StatusUpdate, UpdateOutcome};
use crate::error::{PipelineError, Result};
use crate::models::StatusFile;
use crate::state_machine::JobStatus;

#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    files: DashMap<Uuid, StatusFile>,
    by_path: DashMap<String, Uuid>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get_status_file(&self, job_id: Uuid) -> Result<Option<StatusFile>> {
        Ok(self.files.get(&job_id).map(|entry| entry.value().clone()))
    }

    async fn get_status_file_by_path(&self, path: &str) -> Result<Option<StatusFile>> {
        let Some(job_id) = self.by_path.get(path).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.get_status_file(job_id).await
    }

    /// A log path belongs to one job, as the table's `UNIQUE` column enforces
    async fn insert_or_replace(&self, file: StatusFile) -> Result<()> {
        let path = file.file_path.clone();
        let job_id = file.job_id;
        match self.by_path.entry(path.clone()) {
            Entry::Occupied(owner) if *owner.get() != job_id => {
                return Err(PipelineError::duplicate_log_path(path));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(job_id);
            }
        }
        if let Some(previous) = self.files.insert(job_id, file) {
            if previous.file_path != path {
                self.by_path.remove(&previous.file_path);
            }
        }
        Ok(())
    }

    async fn update_status_file(&self, update: StatusUpdate) -> Result<UpdateOutcome> {
        let Some(mut entry) = self.files.get_mut(&update.job_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        match update.apply(entry.value(), Utc::now()) {
            Some(next) => {
                *entry.value_mut() = next.clone();
                Ok(UpdateOutcome::Applied(next))
            }
            None => Ok(UpdateOutcome::Stale(entry.value().clone())),
        }
    }

    async fn status_files_for_location(
        &self,
        location: &str,
        active_only: bool,
    ) -> Result<Vec<StatusFile>> {
        let mut files: Vec<StatusFile> = self
            .files
            .iter()
            .filter(|entry| entry.location == location)
            .filter(|entry| !active_only || entry.is_in_flight())
            .map(|entry| entry.value().clone())
            .collect();
        files.sort_by_key(|file| file.created_at);
        Ok(files)
    }

    async fn claim_for_requeue(
        &self,
        job_id: Uuid,
        host: &str,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<StatusFile>> {
        let Some(mut entry) = self.files.get_mut(&job_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        let file = entry.value_mut();
        if !file.is_in_flight() || !file.claimable_by(host, now, lease_timeout) {
            return Ok(None);
        }
        if file.status == JobStatus::Running {
            file.status = JobStatus::Waiting;
        }
        file.active_host_name = Some(host.to_string());
        file.host_claimed_at = Some(now);
        file.modified_at = now;
        Ok(Some(file.clone()))
    }

    async fn renew_host_lease(&self, job_id: Uuid, host: &str) -> Result<bool> {
        let Some(mut entry) = self.files.get_mut(&job_id) else {
            return Ok(false);
        };
        let file = entry.value_mut();
        if file.active_host_name.as_deref() != Some(host) {
            return Ok(false);
        }
        file.host_claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn delete_status_file(&self, job_id: Uuid) -> Result<bool> {
        match self.files.remove(&job_id) {
            Some((_, file)) => {
                self.by_path.remove(&file.file_path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_container(&self, container: &str) -> Result<u64> {
        let doomed: Vec<Uuid> = self
            .files
            .iter()
            .filter(|entry| entry.container == container)
            .map(|entry| *entry.key())
            .collect();
        let mut purged = 0;
        for job_id in doomed {
            if self.delete_status_file(job_id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, TaskId};

    fn file(location: &str, container: &str) -> StatusFile {
        let job = Job::new(
            TaskId::new("import", "load"),
            container,
            "d",
            format!("/tmp/{}.log", Uuid::new_v4()),
        );
        StatusFile::for_job(&job, location).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_path() {
        let store = InMemoryStatusStore::new();
        let file = file("local", "/c");
        store.insert_or_replace(file.clone()).await.unwrap();
        assert_eq!(store.get_status_file(file.job_id).await.unwrap(), Some(file.clone()));
        assert_eq!(
            store.get_status_file_by_path(&file.file_path).await.unwrap(),
            Some(file.clone())
        );
        assert!(store.delete_status_file(file.job_id).await.unwrap());
        assert!(store.get_status_file_by_path(&file.file_path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_path_belongs_to_one_job() {
        let store = InMemoryStatusStore::new();
        let first = file("local", "/c");
        store.insert_or_replace(first.clone()).await.unwrap();

        let mut second = file("local", "/c");
        second.file_path = first.file_path.clone();
        let err = store.insert_or_replace(second.clone()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateLogPath { .. }));
        assert!(store.get_status_file(second.job_id).await.unwrap().is_none());

        let mut replaced = first.clone();
        replaced.info = Some("replaced".to_string());
        store.insert_or_replace(replaced).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_outcomes() {
        let store = InMemoryStatusStore::new();
        let file = file("local", "/c");
        store.insert_or_replace(file.clone()).await.unwrap();

        let outcome = store
            .update_status_file(StatusUpdate::for_file(&file).status(JobStatus::Running))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let stale = store
            .update_status_file(StatusUpdate::for_file(&file).status(JobStatus::Waiting))
            .await
            .unwrap();
        assert!(matches!(stale, UpdateOutcome::Stale(ref f) if f.status == JobStatus::Running));

        let missing = store
            .update_status_file(StatusUpdate::for_task(Uuid::new_v4(), "x/y"))
            .await
            .unwrap();
        assert_eq!(missing, UpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_claim_for_requeue_resets_running() {
        let store = InMemoryStatusStore::new();
        let mut running = file("local", "/c");
        running.status = JobStatus::Running;
        running.active_host_name = Some("web2".into());
        running.host_claimed_at = Some(Utc::now());
        store.insert_or_replace(running.clone()).await.unwrap();

        assert!(store
            .claim_for_requeue(running.job_id, "web1", None)
            .await
            .unwrap()
            .is_none());

        let claimed = store
            .claim_for_requeue(running.job_id, "web2", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Waiting);
        assert_eq!(claimed.active_host_name.as_deref(), Some("web2"));
    }

    #[tokio::test]
    async fn test_location_listing_and_purge() {
        let store = InMemoryStatusStore::new();
        let mut done = file("local", "/a");
        done.status = JobStatus::Error;
        store.insert_or_replace(done).await.unwrap();
        store.insert_or_replace(file("local", "/a")).await.unwrap();
        store.insert_or_replace(file("cluster1", "/b")).await.unwrap();

        assert_eq!(store.status_files_for_location("local", false).await.unwrap().len(), 2);
        assert_eq!(store.status_files_for_location("local", true).await.unwrap().len(), 1);
        assert_eq!(store.purge_container("/a").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_renew_lease_only_for_owner() {
        let store = InMemoryStatusStore::new();
        let mut owned = file("local", "/c");
        owned.active_host_name = Some("web1".into());
        store.insert_or_replace(owned.clone()).await.unwrap();
        assert!(store.renew_host_lease(owned.job_id, "web1").await.unwrap());
        assert!(!store.renew_host_lease(owned.job_id, "web2").await.unwrap());
    }
}
