use serde::{Deserialize, Serialize};
use std::fmt;

/// Job status as recorded in the status store and carried on queue messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued for its active task, not yet picked up
    #[default]
    Waiting,
    /// Active task is executing on a worker or remote scheduler
    Running,
    /// Active task finished successfully; the job advances or terminates here
    Complete,
    /// Active task failed; terminal for this attempt
    Error,
    /// Cancellation requested, waiting for the worker to stop
    Cancelling,
    /// Cancellation confirmed; terminal for this attempt
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Waiting,
        Self::Running,
        Self::Complete,
        Self::Error,
        Self::Cancelling,
        Self::Cancelled,
    ];

    /// Statuses with no further transition in the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Statuses that still need a worker (queued, executing or stopping)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Cancelling)
    }

    /// Terminal statuses that an explicit retry may restart
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal_check() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_active_and_terminal_partition() {
        for status in JobStatus::ALL {
            assert_ne!(status.is_active(), status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn test_status_string_conversion() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("in_progress".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&JobStatus::Cancelling).unwrap();
        assert_eq!(json, "\"cancelling\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Cancelling);
    }
}
