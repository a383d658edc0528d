//! Configuration Loader
//!
//! Environment-aware loading: defaults, then `pipeline.toml`, then
//! `pipeline.<environment>.toml`, then `PIPELINE__SECTION__KEY` variables.

use super::error::ConfigResult;
use super::PipelineConfig;
use ::config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE: &str = "pipeline.toml";
const ENV_PREFIX: &str = "PIPELINE";
const ENV_SEPARATOR: &str = "__";

/// Loaded configuration together with the environment it was resolved for
#[derive(Debug)]
pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Missing files are skipped; defaults fill every unset key.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            host_name = %config.host_name(),
            queue_backend = ?config.queue.backend,
            status_store_backend = ?config.status_store.backend,
            "✅ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (embedding and tests)
    pub fn from_config(config: PipelineConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Environment name from `PIPELINE_ENV`, then `APP_ENV`, else `development`
    pub fn detect_environment() -> String {
        env::var("PIPELINE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("PIPELINE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(directory: &Path, environment: &str) -> ConfigResult<PipelineConfig> {
        let base = directory.join(BASE_FILE);
        let overrides = directory.join(format!("pipeline.{environment}.toml"));

        debug!(
            base = %base.display(),
            base_exists = base.exists(),
            overrides = %overrides.display(),
            overrides_exists = overrides.exists(),
            "Resolving configuration layers"
        );

        let settings = Config::builder()
            .add_source(Config::try_from(&PipelineConfig::default())?)
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overrides).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize::<PipelineConfig>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use std::fs;

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().join("absent")), "test")
                .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().local.max_concurrent_jobs, 4);
        assert_eq!(manager.config().queue.backend, Backend::InMemory);
    }

    #[test]
    fn test_from_config_validates() {
        let manager = ConfigManager::from_config(PipelineConfig::default(), "test").unwrap();
        assert_eq!(manager.environment(), "test");

        let mut config = PipelineConfig::default();
        config.local.locations = vec!["gpu".into()];
        config.remote.servers = vec![crate::config::RemoteServerConfig {
            location: "gpu".into(),
        }];
        assert!(ConfigManager::from_config(config, "test").is_err());
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pipeline.toml"),
            r#"
host_name = "web1"

[local]
max_concurrent_jobs = 8
locations = ["local", "convert"]
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("pipeline.production.toml"),
            r#"
[local]
max_concurrent_jobs = 16

[recovery]
host_lease_timeout_seconds = 600
"#,
        )
        .unwrap();

        let manager = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "production",
        )
        .unwrap();
        let config = manager.config();
        assert_eq!(config.host_name(), "web1");
        assert_eq!(config.local.max_concurrent_jobs, 16);
        assert_eq!(config.local.locations, vec!["local", "convert"]);
        assert_eq!(
            config.recovery.host_lease_timeout(),
            Some(std::time::Duration::from_secs(600))
        );
    }

    #[test]
    fn test_cluster_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pipeline.toml"),
            r#"
[cluster_engine]
enabled = true

[[cluster]]
location = "cluster1"
endpoint = "https://sched1.example.org"
available_queues = ["default", "long"]
max_wall_time_minutes = 120

[[cluster]]
location = "cluster2"
endpoint = "https://sched2.example.org"
available_queues = ["gpu"]
"#,
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        let config = manager.config();
        assert_eq!(config.cluster.len(), 2);
        assert_eq!(config.cluster[0].max_wall_time_minutes, Some(120));
        assert!(config.served_locations().contains(&"cluster2".to_string()));
    }

    #[test]
    fn test_invalid_file_is_rejected_by_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pipeline.toml"),
            "[local]\nmax_concurrent_jobs = 0\n",
        )
        .unwrap();
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_variable_layer() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var("PIPELINE__LOGGING__LEVEL", "trace");
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        env::remove_var("PIPELINE__LOGGING__LEVEL");
        assert_eq!(manager.unwrap().config().logging.level, "trace");
    }
}
