use thiserror::Error;

/// Errors raised when a job status transition is not allowed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },
}

impl StateMachineError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: Some(from.to_string()),
            to: to.to_string(),
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
