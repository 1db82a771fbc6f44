//! The pipeline lifecycle state machine (§4.8).
//!
//! `validate_transition` is the single source of truth every mutation of
//! `Pipeline::health.overall_status` must pass through; invariant 2 of §8
//! ("for every state change emitted by the manager, the prior->next pair is
//! present in §4.8") is enforced by routing every status write in
//! `glassflow-manager` through this function.

use crate::error::CoreError;
use crate::model::PipelineStatus;

/// Returns the table entry for `from`: the set of states it may legally
/// transition to. Declared as a match so the table stays a single readable
/// block, the way the teacher's `TransformSpec`/`SinkSpec` enums are matched
/// exhaustively rather than looked up in a runtime map.
fn permitted(from: PipelineStatus) -> &'static [PipelineStatus] {
    use PipelineStatus::*;
    match from {
        Created => &[Running, Failed, Terminating],
        Running => &[Stopping, Pausing, Failed, Terminating],
        Pausing => &[Paused, Failed],
        Paused => &[Resuming, Terminating],
        Resuming => &[Running, Failed],
        Stopping => &[Stopped, Failed],
        Stopped => &[Resuming, Terminating],
        Failed => &[Stopping, Terminating],
        Terminating => &[Terminated, Stopped],
        Terminated => &[],
    }
}

/// Validates a `from -> to` transition against the table, rejecting with
/// `InvalidTransition` otherwise. `Stopped -> Stopped` (the `Edit` no-op
/// that "preserves Stopped") is explicitly legal even though it's not a
/// distinct row in the table.
pub fn validate_transition(from: PipelineStatus, to: PipelineStatus) -> Result<(), CoreError> {
    if from == PipelineStatus::Stopped && to == PipelineStatus::Stopped {
        return Ok(());
    }
    if permitted(from).contains(&to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}
