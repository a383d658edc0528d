//! # Remote Faults
//!
//! Failures reported by a cluster scheduler form a tree: a top-level fault
//! wraps the causes the scheduler passed along. Deciding whether a failure
//! was really a user cancellation is delegated to a [`CancellationDetector`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    UserCancelled,
    Credential,
    Submission,
    Execution,
    Unbind,
    Listener,
    Transport,
    Unknown,
}

impl FaultKind {
    /// Infrastructure faults are logged as warnings unless they end the job
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Credential | Self::Unbind | Self::Listener | Self::Transport)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<RemoteFault>,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            causes: Vec::new(),
        }
    }

    pub fn user_cancelled() -> Self {
        Self::new(FaultKind::UserCancelled, "Job canceled by the user")
    }

    pub fn with_cause(mut self, cause: RemoteFault) -> Self {
        self.causes.push(cause);
        self
    }

    /// This fault and every nested cause, depth first
    pub fn walk(&self) -> Vec<&RemoteFault> {
        let mut out = vec![self];
        for cause in &self.causes {
            out.extend(cause.walk());
        }
        out
    }

    /// Descriptions of the whole tree joined into one message
    pub fn describe(&self) -> String {
        self.walk()
            .iter()
            .map(|f| f.description.as_str())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join(": ")
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

pub trait CancellationDetector: Send + Sync + 'static {
    fn is_user_cancellation(&self, fault: &RemoteFault) -> bool;
}

/// Trusts the fault kind the scheduler reported
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredCancellationDetector;

impl CancellationDetector for StructuredCancellationDetector {
    fn is_user_cancellation(&self, fault: &RemoteFault) -> bool {
        fault.walk().iter().any(|f| f.kind == FaultKind::UserCancelled)
    }
}

/// Schedulers that only report text say "canceled by the user"
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCancellationDetector;

impl CancellationDetector for MessageCancellationDetector {
    fn is_user_cancellation(&self, fault: &RemoteFault) -> bool {
        fault.walk().iter().any(|f| {
            let text = f.description.to_lowercase();
            text.contains("canceled by the user") || text.contains("cancelled by the user")
        })
    }
}

/// Structured check first, then the message heuristic
pub struct CompositeCancellationDetector {
    detectors: Vec<Box<dyn CancellationDetector>>,
}

impl fmt::Debug for CompositeCancellationDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeCancellationDetector")
            .field("detectors", &self.detectors.len())
            .finish()
    }
}

impl CompositeCancellationDetector {
    pub fn new(detectors: Vec<Box<dyn CancellationDetector>>) -> Self {
        Self { detectors }
    }
}

impl Default for CompositeCancellationDetector {
    fn default() -> Self {
        Self::new(vec![
            Box::new(StructuredCancellationDetector),
            Box::new(MessageCancellationDetector),
        ])
    }
}

impl CancellationDetector for CompositeCancellationDetector {
    fn is_user_cancellation(&self, fault: &RemoteFault) -> bool {
        self.detectors.iter().any(|d| d.is_user_cancellation(fault))
    }
}
