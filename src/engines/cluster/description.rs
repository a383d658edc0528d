//! Job description handed to a cluster scheduler, with local paths rewritten
//! to the cluster node's view.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::settings::ResolvedClusterSettings;
use crate::config::{ClusterEngineConfig, PathMapping};
use crate::models::Job;

#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
}

impl PathMapper {
    pub fn new(mappings: Vec<PathMapping>) -> Self {
        Self { mappings }
    }

    /// Rewrite the first matching prefix; unmatched paths pass through
    pub fn map(&self, path: &Path) -> String {
        let local = path.to_string_lossy().replace('\\', "/");
        for mapping in &self.mappings {
            let prefix = mapping.local_prefix.trim_end_matches('/');
            if let Some(rest) = local.strip_prefix(prefix) {
                if rest.is_empty() || rest.starts_with('/') {
                    return format!("{}{}", mapping.remote_prefix.trim_end_matches('/'), rest);
                }
            }
        }
        local
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJobDescription {
    pub endpoint: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    pub queue: Option<String>,
    pub max_cpu_time_minutes: Option<u32>,
    pub max_wall_time_minutes: Option<u32>,
    pub max_time_minutes: Option<u32>,
    pub max_memory_mb: Option<u64>,
    /// Point after which the scheduler may discard the job
    pub termination_time: Option<DateTime<Utc>>,
}

impl ClusterJobDescription {
    /// Run `executable arguments... <snapshot>` on the node
    pub fn build(
        engine: &ClusterEngineConfig,
        settings: &ResolvedClusterSettings,
        job: &Job,
        snapshot_path: &Path,
        mapper: &PathMapper,
        now: DateTime<Utc>,
    ) -> Self {
        let mut arguments = engine.arguments.clone();
        arguments.push(mapper.map(snapshot_path));
        Self {
            endpoint: settings.endpoint.clone(),
            executable: engine.executable.clone(),
            arguments,
            environment: engine.environment.clone(),
            stdout: mapper.map(&job.stdout_path()),
            stderr: mapper.map(&job.stderr_path()),
            queue: settings.queue.clone(),
            max_cpu_time_minutes: settings.max_cpu_time_minutes,
            max_wall_time_minutes: settings.max_wall_time_minutes,
            max_time_minutes: settings.max_time_minutes,
            max_memory_mb: settings.max_memory_mb,
            termination_time: settings
                .termination_time_minutes
                .map(|minutes| now + chrono::Duration::minutes(i64::from(minutes))),
        }
    }
}
