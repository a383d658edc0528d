use serde::{Deserialize, Serialize};

/// Events that move a job between statuses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// A worker picked up the active task
    Start,
    /// The active task finished successfully
    Complete,
    /// The active task failed with the given message
    Fail(String),
    /// A user asked for the job to stop
    RequestCancel,
    /// The worker (or queue removal) confirmed the stop
    ConfirmCancel,
    /// The pipeline moved on to the next task
    Advance,
    /// Explicit resubmission after error or cancellation
    Retry,
}

impl JobEvent {
    /// Event name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::RequestCancel => "request_cancel",
            Self::ConfirmCancel => "confirm_cancel",
            Self::Advance => "advance",
            Self::Retry => "retry",
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
