//! # Command Stages
//!
//! Stages declared under `[[pipelines]]` in configuration. Each one runs an
//! external program with the job's identity and parameters in its
//! environment; the program's output is appended to the job log.
//!
//! | Variable | Value |
//! |---|---|
//! | `PIPELINE_JOB_ID` | job GUID |
//! | `PIPELINE_TASK_ID` | `pipeline/stage` |
//! | `PIPELINE_CONTAINER` | submitting container |
//! | `PIPELINE_LOG_FILE` | job log path |
//! | `PIPELINE_HOST` | host running the stage |
//! | `PIPELINE_PARAM_<NAME>` | one per job parameter |

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::factory::{FnTaskFactory, TaskFactory};
use super::task::{Task, TaskContext, TaskError};
use crate::config::StageDefinition;
use crate::models::{Job, TaskId};

#[derive(Debug, Clone)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
}

impl CommandTask {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// `XTandem, cluster queue` becomes `PIPELINE_PARAM_XTANDEM__CLUSTER_QUEUE`
pub fn parameter_env_name(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("PIPELINE_PARAM_{suffix}")
}

#[async_trait]
impl Task for CommandTask {
    async fn run(&self, job: &mut Job, ctx: &TaskContext) -> Result<(), TaskError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("PIPELINE_JOB_ID", job.guid().to_string())
            .env("PIPELINE_TASK_ID", ctx.task_id.to_string())
            .env("PIPELINE_CONTAINER", &job.container)
            .env("PIPELINE_LOG_FILE", job.log_file_path())
            .env("PIPELINE_HOST", &ctx.host_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &job.parameters {
            command.env(parameter_env_name(name), value);
        }

        let child = command.spawn().map_err(|e| {
            TaskError::failed_with_detail(format!("Could not start {}", self.program), e.to_string())
        })?;
        debug!(program = %self.program, pid = ?child.id(), "Command stage started");

        // Dropping the wait future kills the child
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = ctx.cancelled() => return Err(TaskError::Cancelled),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        job.append_output("stdout", &String::from_utf8_lossy(&output.stdout));
        job.append_output("stderr", &stderr);
        if output.status.success() {
            return Ok(());
        }

        let message = match output.status.code() {
            Some(code) => format!("{} exited with code {code}", self.program),
            None => format!("{} was terminated by a signal", self.program),
        };
        let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty());
        Err(match last_line {
            Some(line) => TaskError::failed_with_detail(message, line.trim()),
            None => TaskError::failed(message),
        })
    }
}

/// Factory for one configured stage of `pipeline`
pub fn command_stage(pipeline: &str, stage: &StageDefinition) -> Arc<dyn TaskFactory> {
    let task = CommandTask::new(stage.command.clone(), stage.args.clone());
    let mut factory = FnTaskFactory::new(
        TaskId::new(pipeline, stage.name.as_str()),
        stage.location.clone(),
        move |_| Ok(Box::new(task.clone()) as Box<dyn Task>),
    );
    if !stage.supports_retry {
        factory = factory.without_retry();
    }
    if let Some(group) = &stage.group {
        factory = factory.with_group(group.clone());
    }
    Arc::new(factory)
}
