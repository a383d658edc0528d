//! # Task Registry
//!
//! Ordered stage lists per pipeline and factory lookup by task ID.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::command::command_stage;
use super::factory::TaskFactory;
use crate::config::PipelineDefinition;
use crate::error::{PipelineError, Result};
use crate::models::TaskId;

#[derive(Default)]
pub struct TaskRegistry {
    factories: DashMap<TaskId, Arc<dyn TaskFactory>>,
    pipelines: DashMap<String, Vec<TaskId>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("pipelines", &self.pipelines.len())
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline's stages in execution order, replacing any
    /// previous definition of the same pipeline
    pub fn register_pipeline(
        &self,
        pipeline: &str,
        stages: Vec<Arc<dyn TaskFactory>>,
    ) -> Result<()> {
        if stages.is_empty() {
            return Err(PipelineError::invalid_operation(format!(
                "Pipeline '{pipeline}' has no stages"
            )));
        }
        let mut order = Vec::with_capacity(stages.len());
        for factory in &stages {
            let id = factory.id();
            if id.pipeline() != pipeline {
                return Err(PipelineError::invalid_operation(format!(
                    "Task '{id}' does not belong to pipeline '{pipeline}'"
                )));
            }
            if order.contains(id) {
                return Err(PipelineError::invalid_operation(format!(
                    "Task '{id}' registered twice"
                )));
            }
            order.push(id.clone());
        }

        if let Some((_, previous)) = self.pipelines.remove(pipeline) {
            for id in previous {
                self.factories.remove(&id);
            }
        }
        for factory in stages {
            self.factories.insert(factory.id().clone(), factory);
        }
        info!(pipeline = %pipeline, stages = order.len(), "📦 Pipeline registered");
        self.pipelines.insert(pipeline.to_string(), order);
        Ok(())
    }

    /// Register every configured command pipeline
    pub fn register_definitions(&self, definitions: &[PipelineDefinition]) -> Result<()> {
        for definition in definitions {
            let stages = definition
                .stages
                .iter()
                .map(|stage| command_stage(&definition.name, stage))
                .collect();
            self.register_pipeline(&definition.name, stages)?;
        }
        Ok(())
    }

    pub fn factory(&self, task_id: &TaskId) -> Result<Arc<dyn TaskFactory>> {
        self.factories
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PipelineError::unknown_task(task_id))
    }

    pub fn first_task(&self, pipeline: &str) -> Result<TaskId> {
        self.pipelines
            .get(pipeline)
            .and_then(|stages| stages.first().cloned())
            .ok_or_else(|| PipelineError::unknown_pipeline(pipeline))
    }

    /// Stage after `task_id`, or `None` when it is the last one
    pub fn next_task(&self, task_id: &TaskId) -> Result<Option<TaskId>> {
        let stages = self
            .pipelines
            .get(task_id.pipeline())
            .ok_or_else(|| PipelineError::unknown_pipeline(task_id.pipeline()))?;
        let index = stages
            .iter()
            .position(|id| id == task_id)
            .ok_or_else(|| PipelineError::unknown_task(task_id))?;
        Ok(stages.get(index + 1).cloned())
    }

    pub fn location_for(&self, task_id: &TaskId) -> Result<String> {
        Ok(self.factory(task_id)?.execution_location().to_string())
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Every distinct execution location used by a registered stage
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.value().execution_location().to_string())
            .collect();
        locations.sort();
        locations.dedup();
        locations
    }
}
