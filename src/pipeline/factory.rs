//! # Task Factory
//!
//! Static description of one pipeline stage: where it runs, whether it may be
//! retried, the cluster resources it asks for, and how to build its runnable.

use super::task::{Task, TaskError};
use crate::models::{Job, TaskId};

/// Cluster resource requests a stage makes; `None` keeps the server setting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceOverrides {
    pub location: Option<String>,
    pub queue: Option<String>,
    pub max_cpu_time_minutes: Option<u32>,
    pub max_wall_time_minutes: Option<u32>,
    pub max_time_minutes: Option<u32>,
    pub max_memory_mb: Option<u64>,
}

pub trait TaskFactory: Send + Sync + 'static {
    fn id(&self) -> &TaskId;

    /// Execution location consumers select on
    fn execution_location(&self) -> &str;

    fn supports_retry(&self) -> bool {
        true
    }

    /// Parameter group holding the job's cluster overrides for this stage
    fn group_parameter_name(&self) -> Option<&str> {
        None
    }

    fn cluster_overrides(&self) -> ResourceOverrides {
        ResourceOverrides::default()
    }

    fn create_task(&self, job: &Job) -> Result<Box<dyn Task>, TaskError>;
}

type TaskBuilder = dyn Fn(&Job) -> Result<Box<dyn Task>, TaskError> + Send + Sync;

/// Closure-backed factory for pipelines assembled in code
pub struct FnTaskFactory {
    id: TaskId,
    location: String,
    supports_retry: bool,
    group: Option<String>,
    overrides: ResourceOverrides,
    builder: Box<TaskBuilder>,
}

impl std::fmt::Debug for FnTaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTaskFactory")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("supports_retry", &self.supports_retry)
            .field("group", &self.group)
            .finish()
    }
}

impl FnTaskFactory {
    pub fn new<F>(id: TaskId, location: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Job) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        Self {
            id,
            location: location.into(),
            supports_retry: true,
            group: None,
            overrides: ResourceOverrides::default(),
            builder: Box::new(builder),
        }
    }

    pub fn without_retry(mut self) -> Self {
        self.supports_retry = false;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ResourceOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

impl TaskFactory for FnTaskFactory {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn execution_location(&self) -> &str {
        &self.location
    }

    fn supports_retry(&self) -> bool {
        self.supports_retry
    }

    fn group_parameter_name(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn cluster_overrides(&self) -> ResourceOverrides {
        self.overrides.clone()
    }

    fn create_task(&self, job: &Job) -> Result<Box<dyn Task>, TaskError> {
        (self.builder)(job)
    }
}
