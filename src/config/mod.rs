//! # Pipeline Configuration
//!
//! Typed configuration for the job execution core, loaded in layers by
//! [`ConfigManager`]: built-in defaults, `pipeline.toml`,
//! `pipeline.<environment>.toml`, then `PIPELINE__*` environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pipeline_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let local = &manager.config().local;
//! println!("{} local slots on {:?}", local.max_concurrent_jobs, local.locations);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::constants;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Storage backend for the queue transport and the status store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name this process uses to claim jobs; falls back to `$HOSTNAME`
    pub host_name: Option<String>,

    pub database: DatabaseConfig,

    pub queue: QueueConfig,

    pub status_store: StatusStoreConfig,

    /// In-process execution engine
    pub local: LocalEngineConfig,

    /// Startup requeue sweep
    pub recovery: RecoveryConfig,

    /// Queue-backed remote server engines
    pub remote: RemoteConfig,

    /// Ordered cluster server settings; the first entry is the default
    pub cluster: Vec<ClusterSettings>,

    pub cluster_engine: ClusterEngineConfig,

    pub logging: LoggingConfig,

    /// Pipelines whose stages run external commands
    pub pipelines: Vec<PipelineDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pipeline".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: Backend,
    /// How long a consumer waits for a matching message per receive call
    pub receive_wait_ms: u64,
    /// Polling interval of the PostgreSQL transport while waiting
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: Backend::InMemory,
            receive_wait_ms: 1_000,
            poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusStoreConfig {
    pub backend: Backend,
    pub queue_position_ttl_ms: u64,
}

impl Default for StatusStoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::InMemory,
            queue_position_ttl_ms: constants::DEFAULT_QUEUE_POSITION_TTL.as_millis() as u64,
        }
    }
}

impl StatusStoreConfig {
    pub fn queue_position_ttl(&self) -> Duration {
        Duration::from_millis(self.queue_position_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalEngineConfig {
    pub enabled: bool,
    /// Locations whose tasks this process runs in-process
    pub locations: Vec<String>,
    pub max_concurrent_jobs: usize,
    /// Lease renewal and cross-process cancel check while a task runs
    pub heartbeat_interval_ms: u64,
    /// Time in-flight tasks get to finish after shutdown is requested
    pub shutdown_grace_period_ms: u64,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            locations: vec![constants::locations::LOCAL.to_string()],
            max_concurrent_jobs: 4,
            heartbeat_interval_ms: 10_000,
            shutdown_grace_period_ms: 30_000,
        }
    }
}

impl LocalEngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Jobs owned by another host become claimable once their lease is this
    /// old. Unset keeps strict ownership.
    pub host_lease_timeout_seconds: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_lease_timeout_seconds: None,
        }
    }
}

impl RecoveryConfig {
    pub fn host_lease_timeout(&self) -> Option<Duration> {
        self.host_lease_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Interval of the background batch status poll for remote engines
    pub poll_interval_ms: u64,
    /// Locations served by queue-backed remote worker processes
    pub servers: Vec<RemoteServerConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            servers: Vec::new(),
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteServerConfig {
    pub location: String,
}

/// Settings for one cluster scheduler server
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ClusterSettings {
    pub location: String,
    /// Scheduler endpoint
    pub endpoint: String,
    pub available_queues: Vec<String>,
    /// Queue used when neither the task nor the job names one
    pub queue: Option<String>,
    pub max_cpu_time_minutes: Option<u32>,
    pub max_wall_time_minutes: Option<u32>,
    pub max_time_minutes: Option<u32>,
    pub max_memory_mb: Option<u64>,
    /// Minutes after submission at which the scheduler may discard the job
    pub termination_time_minutes: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub name: String,
    /// Execution order
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: String,
    pub location: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_supports_retry")]
    pub supports_retry: bool,
    /// Parameter group holding the job's cluster overrides for this stage
    #[serde(default)]
    pub group: Option<String>,
}

fn default_supports_retry() -> bool {
    true
}

/// Prefix rewrite from this host's view of a path to the cluster node's view
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PathMapping {
    pub local_prefix: String,
    pub remote_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterEngineConfig {
    pub enabled: bool,
    /// Program started on the cluster node
    pub executable: String,
    /// Arguments placed before the snapshot path
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub path_mappings: Vec<PathMapping>,
    /// Bound on waiting for remote output files after a terminal callback
    pub output_wait_timeout_ms: u64,
    pub output_poll_interval_ms: u64,
}

impl Default for ClusterEngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            executable: "pipeline-worker".to_string(),
            arguments: vec!["run-job".to_string()],
            environment: BTreeMap::new(),
            path_mappings: Vec::new(),
            output_wait_timeout_ms: 30_000,
            output_poll_interval_ms: 1_000,
        }
    }
}

impl ClusterEngineConfig {
    pub fn output_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.output_wait_timeout_ms)
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl PipelineConfig {
    /// Host name used for job ownership
    pub fn host_name(&self) -> String {
        self.host_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Database URL, `DATABASE_URL` taking precedence over the file value
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database.url.clone())
    }

    pub fn uses_postgres(&self) -> bool {
        self.queue.backend == Backend::Postgres || self.status_store.backend == Backend::Postgres
    }

    /// Locations this process consumes: local engine locations, remote
    /// servers and cluster locations (when enabled)
    pub fn served_locations(&self) -> Vec<String> {
        let mut locations = Vec::new();
        if self.local.enabled {
            locations.extend(self.local.locations.iter().cloned());
        }
        locations.extend(self.remote.servers.iter().map(|s| s.location.clone()));
        if self.cluster_engine.enabled {
            locations.extend(self.cluster.iter().map(|s| s.location.clone()));
        }
        locations
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.local.enabled {
            if self.local.locations.is_empty() {
                return Err(ConfigurationError::missing_field("local.locations"));
            }
            if self.local.max_concurrent_jobs == 0 {
                return Err(ConfigurationError::invalid_value(
                    "local.max_concurrent_jobs",
                    "must be at least 1",
                ));
            }
            if self.local.heartbeat_interval_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    "local.heartbeat_interval_ms",
                    "must be positive",
                ));
            }
        }

        if self.queue.receive_wait_ms == 0 || self.queue.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue",
                "receive_wait_ms and poll_interval_ms must be positive",
            ));
        }

        if self.status_store.queue_position_ttl_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "status_store.queue_position_ttl_ms",
                "must be positive",
            ));
        }

        if self.uses_postgres() && self.database_url().trim().is_empty() {
            return Err(ConfigurationError::missing_field("database.url"));
        }

        if self.recovery.host_lease_timeout_seconds == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "recovery.host_lease_timeout_seconds",
                "must be positive when set",
            ));
        }

        let mut seen = HashSet::new();
        for location in self.served_locations() {
            if location.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "locations",
                    "location names must not be empty",
                ));
            }
            if !seen.insert(location.to_lowercase()) {
                return Err(ConfigurationError::invalid_value(
                    "locations",
                    format!("location '{location}' is served by more than one engine"),
                ));
            }
        }

        self.validate_cluster()?;
        self.validate_pipelines()
    }

    fn validate_pipelines(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for (index, pipeline) in self.pipelines.iter().enumerate() {
            let field = format!("pipelines[{index}]");
            if pipeline.name.trim().is_empty() {
                return Err(ConfigurationError::missing_field(format!("{field}.name")));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    format!("{field}.name"),
                    format!("pipeline '{}' is defined twice", pipeline.name),
                ));
            }
            if pipeline.stages.is_empty() {
                return Err(ConfigurationError::invalid_value(
                    format!("{field}.stages"),
                    "at least one stage is required",
                ));
            }
            for (position, stage) in pipeline.stages.iter().enumerate() {
                let stage_field = format!("{field}.stages[{position}]");
                for (name, value) in [
                    ("name", &stage.name),
                    ("location", &stage.location),
                    ("command", &stage.command),
                ] {
                    if value.trim().is_empty() {
                        return Err(ConfigurationError::missing_field(format!("{stage_field}.{name}")));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_cluster(&self) -> ConfigResult<()> {
        if self.cluster_engine.enabled && self.cluster.is_empty() {
            return Err(ConfigurationError::missing_field("cluster"));
        }
        for (index, settings) in self.cluster.iter().enumerate() {
            let field = format!("cluster[{index}]");
            if settings.location.trim().is_empty() {
                return Err(ConfigurationError::missing_field(format!("{field}.location")));
            }
            if settings.available_queues.is_empty() {
                return Err(ConfigurationError::invalid_value(
                    format!("{field}.available_queues"),
                    "at least one queue is required",
                ));
            }
            if let Some(queue) = &settings.queue {
                if !settings.available_queues.contains(queue) {
                    return Err(ConfigurationError::invalid_value(
                        format!("{field}.queue"),
                        format!("default queue '{queue}' is not in available_queues"),
                    ));
                }
            }
        }
        if self.cluster_engine.executable.trim().is_empty() {
            return Err(ConfigurationError::missing_field("cluster_engine.executable"));
        }
        Ok(())
    }
}
