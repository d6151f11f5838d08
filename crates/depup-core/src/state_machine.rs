//! Deployment update lifecycle
//!
//! ```text
//! (new) ─► UPDATING ─► EXECUTING_WORKFLOW ─► FINALIZING ─► SUCCESSFUL
//!   │         │               │                   │
//!   │         └───────────────┴───────────────────┴──────► FAILED
//!   └─► NO_CHANGES_REQUIRED
//! ```

use crate::error::StateMachineError;
use crate::types::{DeploymentUpdate, StateTransition, UpdateState};
use chrono::{DateTime, Utc};

/// States reachable from `from`; `None` is a record being created
#[must_use]
pub fn allowed_transitions(from: Option<UpdateState>) -> &'static [UpdateState] {
    match from {
        None => &[UpdateState::Updating, UpdateState::NoChangesRequired],
        Some(UpdateState::Updating) => &[UpdateState::ExecutingWorkflow, UpdateState::Failed],
        Some(UpdateState::ExecutingWorkflow) => &[UpdateState::Finalizing, UpdateState::Failed],
        Some(UpdateState::Finalizing) => &[UpdateState::Successful, UpdateState::Failed],
        Some(UpdateState::Successful | UpdateState::Failed | UpdateState::NoChangesRequired) => &[],
    }
}

/// Check a single transition
///
/// # Errors
/// - [`StateMachineError::Terminal`] when `from` is terminal
/// - [`StateMachineError::IllegalTransition`] for any other edge not in the graph
///
/// With the `strict-debug` feature an illegal transition panics instead.
pub fn validate_transition(
    from: Option<UpdateState>,
    to: UpdateState,
) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        return Ok(());
    }

    #[cfg(feature = "strict-debug")]
    panic!("illegal deployment update transition: {from:?} -> {to:?}");

    Err(match from {
        Some(state) if state.is_terminal() => StateMachineError::Terminal { state },
        _ => StateMachineError::IllegalTransition { from, to },
    })
}

/// Move `record` to `to`, appending to its history
///
/// # Errors
/// See [`validate_transition`]. The record is untouched on error.
pub fn transition(
    record: &mut DeploymentUpdate,
    to: UpdateState,
    at: DateTime<Utc>,
) -> Result<(), StateMachineError> {
    validate_transition(Some(record.state), to)?;
    record.transitions.push(StateTransition {
        from: Some(record.state),
        to,
        at,
    });
    record.state = to;
    Ok(())
}
