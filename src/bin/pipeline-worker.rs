//! # Pipeline Worker
//!
//! Thin binary around the pipeline core.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the locations configured in pipeline.toml
//! pipeline-worker serve
//!
//! # Run a serialized job on a cluster node
//! pipeline-worker run-job /mnt/files/run1/job.job.json
//!
//! # Validate configuration for an environment
//! PIPELINE_ENV=production pipeline-worker check-config
//! ```
//!
//! The binary serves the command pipelines declared under `[[pipelines]]`.
//! `run-job` loads the same configuration, so a cluster node or remote lane
//! worker resolves the same stages as the submitting host. Applications with
//! in-process tasks register them on a [`TaskRegistry`] and start a
//! `WorkerProcess` themselves.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipeline_core::config::ConfigManager;
use pipeline_core::engines::cluster::{ProxyCredential, SimulatedClusterScheduler, StaticCredentialProvider};
use pipeline_core::logging::init_structured_logging;
use pipeline_core::pipeline::TaskRegistry;
use pipeline_core::service::PipelineContext;
use pipeline_core::worker::{run_job_file, shutdown_signal, WorkerProcess};

#[derive(Parser, Debug)]
#[command(name = "pipeline-worker")]
#[command(about = "Pipeline job execution worker")]
#[command(version)]
struct Cli {
    /// Directory holding pipeline.toml and pipeline.<env>.toml
    #[arg(long, env = "PIPELINE_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Configuration environment (defaults to PIPELINE_ENV / APP_ENV)
    #[arg(long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover and serve the configured locations until interrupted
    Serve {
        /// Proxy token used with the development cluster scheduler
        #[arg(long, env = "PIPELINE_CLUSTER_TOKEN", default_value = "")]
        cluster_token: String,
    },
    /// Run the active task of a serialized job (cluster node entry point)
    RunJob {
        snapshot: PathBuf,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment);
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &environment)
        .map_err(|e| format!("Failed to load configuration: {e}"))?;
    init_structured_logging(&manager.config().logging);

    match cli.command {
        Command::Serve { cluster_token } => serve(&manager, cluster_token).await,
        Command::RunJob { snapshot } => {
            let code = run_job(&manager, &snapshot).await?;
            std::process::exit(code);
        }
        Command::CheckConfig => {
            let config = manager.config();
            let registry = configured_registry(&manager)?;
            info!(
                environment = %manager.environment(),
                directory = %manager.config_directory().display(),
                host = %config.host_name(),
                locations = ?config.served_locations(),
                pipelines = ?registry.pipeline_names(),
                "✅ Configuration is valid"
            );
            Ok(())
        }
    }
}

async fn serve(manager: &ConfigManager, cluster_token: String) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 Starting pipeline worker");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   Environment: {}", manager.environment());

    let registry = Arc::new(configured_registry(manager)?);
    info!("   Pipelines: {:?}", registry.pipeline_names());
    let context = Arc::new(PipelineContext::connect(manager, registry).await?);

    let mut builder = WorkerProcess::builder(Arc::clone(&context));
    if context.config().cluster_engine.enabled {
        warn!("Cluster engine enabled; using the simulated scheduler");
        let credential = ProxyCredential::new(context.host_name(), cluster_token);
        builder = builder.with_cluster_scheduler(
            Arc::new(SimulatedClusterScheduler::new()),
            Arc::new(StaticCredentialProvider::new(credential)),
        );
    }
    let worker = builder.start().await?;
    for report in worker.recovery_reports() {
        info!(
            location = %report.location,
            requeued = report.requeued,
            errored = report.errored,
            still_running = report.still_running,
            "   Recovery"
        );
    }
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;
    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    if let Err(e) = worker.shutdown().await {
        error!("Failed to stop worker cleanly: {}", e);
    }
    info!("👋 Pipeline worker shutdown complete");
    Ok(())
}

async fn run_job(manager: &ConfigManager, snapshot: &std::path::Path) -> Result<i32, Box<dyn std::error::Error>> {
    let registry = configured_registry(manager)?;
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let outcome = run_job_file(&registry, snapshot, &manager.config().host_name(), token).await?;
    info!(outcome = ?outcome, "Cluster node run finished");
    Ok(outcome.exit_code())
}

fn configured_registry(manager: &ConfigManager) -> Result<TaskRegistry, Box<dyn std::error::Error>> {
    let registry = TaskRegistry::new();
    registry.register_definitions(&manager.config().pipelines)?;
    Ok(registry)
}
