//! # Job Model
//!
//! A job is one unit of background work moving through an ordered pipeline.
//! Its GUID never changes; the active task, status, log and business state
//! evolve as stages run. Jobs travel between processes as JSON snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::constants::{cluster_output, snapshot};
use crate::error::{PipelineError, Result};
use crate::models::TaskId;
use crate::state_machine::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One timestamped line of the job log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    guid: Uuid,
    active_task_id: TaskId,
    pub status: JobStatus,
    log_file_path: PathBuf,
    /// Submitting context (folder/project) the job belongs to
    pub container: String,
    pub description: String,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Opaque business state owned by the task implementations
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    log: Vec<LogEntry>,
    #[serde(default)]
    error_count: u32,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SnapshotOut<'a> {
    format_version: u32,
    job: &'a Job,
}

#[derive(Deserialize)]
struct SnapshotIn {
    format_version: u32,
    job: Job,
}

impl Job {
    pub fn new(
        first_task: TaskId,
        container: impl Into<String>,
        description: impl Into<String>,
        log_file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            guid: Uuid::new_v4(),
            active_task_id: first_task,
            status: JobStatus::Waiting,
            log_file_path: log_file_path.into(),
            container: container.into(),
            description: description.into(),
            submitter: None,
            parameters: BTreeMap::new(),
            state: serde_json::Value::Null,
            log: Vec::new(),
            error_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn active_task_id(&self) -> &TaskId {
        &self.active_task_id
    }

    /// Only the pipeline runner moves a job between tasks
    pub(crate) fn set_active_task(&mut self, task_id: TaskId) {
        self.active_task_id = task_id;
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.log
            .iter()
            .rev()
            .find(|entry| entry.level == LogLevel::Error)
            .map(|entry| entry.message.as_str())
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.push_log(LogLevel::Error, message.into());
    }

    /// Append captured remote output (stdout/stderr) to the job log
    pub fn append_output(&mut self, label: &str, output: &str) {
        let trimmed = output.trim_end();
        if trimmed.is_empty() {
            return;
        }
        self.push_log(LogLevel::Info, format!("[{label}]\n{trimmed}"));
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// URI handed to remote schedulers; one submission per job and task
    pub fn job_uri(&self) -> String {
        format!(
            "{}:{}/{}",
            snapshot::URI_SCHEME,
            self.guid,
            self.active_task_id
        )
    }

    /// Snapshot file written next to the log file, e.g. `run1.job.json`
    pub fn snapshot_path(&self) -> PathBuf {
        self.log_file_path.with_extension(snapshot::FILE_EXTENSION)
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.log_file_path
            .with_extension(cluster_output::STDOUT_EXTENSION)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.log_file_path
            .with_extension(cluster_output::STDERR_EXTENSION)
    }

    pub fn to_snapshot(&self) -> Result<String> {
        let document = SnapshotOut {
            format_version: snapshot::FORMAT_VERSION,
            job: self,
        };
        Ok(serde_json::to_string(&document)?)
    }

    pub fn from_snapshot(data: &str) -> Result<Self> {
        let document: SnapshotIn = serde_json::from_str(data)
            .map_err(|e| PipelineError::invalid_snapshot(e.to_string()))?;
        if document.format_version > snapshot::FORMAT_VERSION {
            return Err(PipelineError::invalid_snapshot(format!(
                "unsupported format version {} (max {})",
                document.format_version,
                snapshot::FORMAT_VERSION
            )));
        }
        Ok(document.job)
    }

    pub async fn write_snapshot_file(&self) -> Result<PathBuf> {
        let path = self.snapshot_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, self.to_snapshot()?).await?;
        Ok(path)
    }

    pub async fn read_snapshot_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::from_snapshot(&data)
    }
}
