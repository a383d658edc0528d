use super::{
    errors::{StateMachineError, StateMachineResult},
    events::JobEvent,
    states::JobStatus,
};

/// Transition table for job statuses.
///
/// Stateless: persistence lives in the status store, which uses
/// [`JobStateMachine::allowed_predecessors`] to make its updates conditional.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobStateMachine;

impl JobStateMachine {
    /// Target status for `event` applied to `current`
    pub fn determine_target_state(
        current: JobStatus,
        event: &JobEvent,
    ) -> StateMachineResult<JobStatus> {
        let target = match (current, event) {
            (JobStatus::Waiting, JobEvent::Start) => JobStatus::Running,

            (JobStatus::Running, JobEvent::Complete) => JobStatus::Complete,

            (JobStatus::Waiting, JobEvent::Fail(_)) => JobStatus::Error,
            (JobStatus::Running, JobEvent::Fail(_)) => JobStatus::Error,

            (JobStatus::Waiting, JobEvent::RequestCancel) => JobStatus::Cancelling,
            (JobStatus::Running, JobEvent::RequestCancel) => JobStatus::Cancelling,
            (JobStatus::Cancelling, JobEvent::ConfirmCancel) => JobStatus::Cancelled,

            (JobStatus::Complete, JobEvent::Advance) => JobStatus::Waiting,

            (JobStatus::Error, JobEvent::Retry) => JobStatus::Waiting,
            (JobStatus::Cancelled, JobEvent::Retry) => JobStatus::Waiting,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from_state.to_string()),
                    to: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Statuses from which `target` may be reached in one legal step
    pub fn allowed_predecessors(target: JobStatus) -> &'static [JobStatus] {
        match target {
            JobStatus::Waiting => &[JobStatus::Complete, JobStatus::Error, JobStatus::Cancelled],
            JobStatus::Running => &[JobStatus::Waiting],
            JobStatus::Complete => &[JobStatus::Running],
            JobStatus::Error => &[JobStatus::Waiting, JobStatus::Running],
            JobStatus::Cancelling => &[JobStatus::Waiting, JobStatus::Running],
            JobStatus::Cancelled => &[JobStatus::Cancelling],
        }
    }

    /// Whether `from -> to` is a legal single step. Re-asserting the current
    /// status is accepted so duplicate deliveries stay harmless.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        from == to || Self::allowed_predecessors(to).contains(&from)
    }

    /// Validate `from -> to`, returning the error used by callers that must
    /// not silently ignore a rejected transition
    pub fn ensure_transition(from: JobStatus, to: JobStatus) -> StateMachineResult<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(StateMachineError::invalid_transition(from, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path() {
        let running =
            JobStateMachine::determine_target_state(JobStatus::Waiting, &JobEvent::Start).unwrap();
        assert_eq!(running, JobStatus::Running);
        let complete =
            JobStateMachine::determine_target_state(running, &JobEvent::Complete).unwrap();
        assert_eq!(complete, JobStatus::Complete);
        let next = JobStateMachine::determine_target_state(complete, &JobEvent::Advance).unwrap();
        assert_eq!(next, JobStatus::Waiting);
    }

    #[test]
    fn test_running_to_waiting_is_rejected() {
        assert!(!JobStateMachine::can_transition(
            JobStatus::Running,
            JobStatus::Waiting
        ));
        let err = JobStateMachine::ensure_transition(JobStatus::Running, JobStatus::Waiting)
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_cancellation_is_two_phase() {
        assert!(JobStateMachine::can_transition(
            JobStatus::Waiting,
            JobStatus::Cancelling
        ));
        assert!(!JobStateMachine::can_transition(
            JobStatus::Waiting,
            JobStatus::Cancelled
        ));
        assert!(!JobStateMachine::can_transition(
            JobStatus::Cancelling,
            JobStatus::Complete
        ));
        assert!(!JobStateMachine::can_transition(
            JobStatus::Complete,
            JobStatus::Cancelling
        ));
    }

    #[test]
    fn test_event_table_agrees_with_predecessors() {
        let events = [
            JobEvent::Start,
            JobEvent::Complete,
            JobEvent::fail_with_error("boom"),
            JobEvent::RequestCancel,
            JobEvent::ConfirmCancel,
            JobEvent::Advance,
            JobEvent::Retry,
        ];
        for from in JobStatus::ALL {
            for event in &events {
                if let Ok(to) = JobStateMachine::determine_target_state(from, event) {
                    assert!(
                        JobStateMachine::allowed_predecessors(to).contains(&from),
                        "{from} --{}--> {to} missing from predecessor table",
                        event.event_type()
                    );
                }
            }
        }
    }

    #[test]
    fn test_terminal_error_requires_retry() {
        assert!(
            JobStateMachine::determine_target_state(JobStatus::Error, &JobEvent::Start).is_err()
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobStatus::Error, &JobEvent::Retry).unwrap(),
            JobStatus::Waiting
        );
    }
}
