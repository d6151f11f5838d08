//! Error types for the update engine

use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::gatekeeper::AdmissionRejection;
use crate::storage::StorageError;
use crate::types::{DeploymentUpdateId, ExecutionId, UpdateState};
use depup_planner::PlanError;
use depup_topology::TopologyError;

/// Illegal lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition from {} to {to}", from.map_or("<new>", UpdateState::as_str))]
    IllegalTransition {
        from: Option<UpdateState>,
        to: UpdateState,
    },

    #[error("record in terminal state {state} cannot change")]
    Terminal { state: UpdateState },
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("update rejected: {0}")]
    Rejected(AdmissionRejection),

    /// Optimistic concurrency check failed; the caller may resubmit
    #[error("version conflict: {0}")]
    VersionConflict(StorageError),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("deployment update not found: {0}")]
    UpdateNotFound(DeploymentUpdateId),

    #[error("no deployment update owns execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution token mismatch for execution {0}")]
    InvalidExecutionToken(ExecutionId),

    #[error("cannot {action} update {update_id} in state {state}")]
    InvalidState {
        update_id: DeploymentUpdateId,
        state: UpdateState,
        action: &'static str,
    },
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Rejected(reason) => Self::Rejected(reason),
            StorageError::VersionConflict { .. } => Self::VersionConflict(err),
            other => Self::Storage(other),
        }
    }
}

impl EngineError {
    /// Resubmitting the same request may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict(_) => true,
            Self::Storage(err) => err.is_transient(),
            Self::Executor(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Caused by the system rather than by the caller's input or an expected
    /// admission conflict
    #[must_use]
    pub fn is_fault(&self) -> bool {
        !matches!(
            self,
            Self::Topology(_)
                | Self::Plan(_)
                | Self::Rejected(_)
                | Self::InvalidState { .. }
                | Self::InvalidExecutionToken(_)
                | Self::UpdateNotFound(_)
        )
    }
}
