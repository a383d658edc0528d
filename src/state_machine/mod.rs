// Job status state machine
//
// Statuses, the events that move between them and the transition table the
// status store relies on for conditional updates.

pub mod errors;
pub mod events;
pub mod job_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::JobEvent;
pub use job_state_machine::JobStateMachine;
pub use states::JobStatus;
