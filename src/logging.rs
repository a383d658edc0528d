//! # Structured Logging Module
//!
//! One-time `tracing` subscriber setup (pretty or JSON) and structured helpers
//! for job, queue and engine operations.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. `RUST_LOG` wins over the configured level.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let level = if config.level.trim().is_empty() {
            get_log_level(&environment).to_string()
        } else {
            config.level.clone()
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_filter(filter),
                )
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(true)
                        .with_filter(filter),
                )
                .try_init(),
        };

        // A host application may already own the global subscriber
        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            level = %level,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("PIPELINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Fallback log level when the configured level is blank
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for job lifecycle operations
pub fn log_job_operation(
    operation: &str,
    job_id: Option<Uuid>,
    task_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = ?job_id,
        task_id = task_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log structured data for queue transport operations
pub fn log_queue_operation(
    operation: &str,
    location: Option<&str>,
    job_id: Option<Uuid>,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        location = location,
        job_id = ?job_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📬 QUEUE_OPERATION"
    );
}

/// Log structured data for execution engine operations
pub fn log_engine_operation(
    engine: &str,
    location: &str,
    operation: &str,
    job_id: Option<Uuid>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        engine = %engine,
        location = %location,
        operation = %operation,
        job_id = ?job_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "⚙️ ENGINE_OPERATION"
    );
}
