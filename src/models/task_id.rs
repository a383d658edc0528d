use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifies one stage of a pipeline, written `pipeline/stage`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    pipeline: String,
    stage: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid task id '{value}': expected 'pipeline/stage'")]
pub struct ParseTaskIdError {
    pub value: String,
}

impl TaskId {
    pub fn new(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline, self.stage)
    }
}

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    // Stage names never contain '/', pipeline names may
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((pipeline, stage)) if !pipeline.is_empty() && !stage.is_empty() => {
                Ok(Self::new(pipeline, stage))
            }
            _ => Err(ParseTaskIdError {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TaskId {
    type Error = ParseTaskIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}
