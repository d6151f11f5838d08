//! Deployment update lifecycle
//!
//! Takes a deployment from its current topology to a new one:
//! - Diffs the topologies and plans ordered steps
//! - Admits at most one active update per deployment
//! - Pre-creates and selects node instances for scaling
//! - Hands lifecycle operations to a [`WorkflowExecutor`] under a secret token
//! - Commits the new topology once the workflow succeeds
//!
//! # State machine
//!
//! `UPDATING → EXECUTING_WORKFLOW → FINALIZING → SUCCESSFUL`, with `FAILED`
//! reachable from every non-terminal state and `NO_CHANGES_REQUIRED` for
//! submissions that change nothing. See [`state_machine`].
//!
//! # Example
//!
//! ```rust,ignore
//! use depup_core::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.seed_deployment(DeploymentId::new("shop"), current);
//! let engine = UpdateEngine::new(store, executor, EngineConfig::default());
//!
//! let update = engine.submit_update(&DeploymentId::new("shop"), candidate).await?;
//! // ... later, when the executor reports back:
//! let update = engine.on_execution_event(event).await?;
//! assert_eq!(update.state, UpdateState::Successful);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gatekeeper;
mod retry;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use config::{ConfigError, EngineConfig, RetryPolicy, StorageRetryPolicy};
pub use coordinator::{
    EventOutcome, ExecutionCoordinator, ExecutionHandle, InstanceAssignment, OperationError,
};
pub use engine::UpdateEngine;
pub use error::{EngineError, StateMachineError};
pub use executor::{
    ExecutionEvent, ExecutionRequest, ExecutionStatus, ExecutionToken, ExecutorError,
    LifecycleAction, LifecycleOperation, WorkflowExecutor,
};
pub use gatekeeper::{AdmissionRejection, Gatekeeper, SubmitOptions};
pub use storage::{CreatedInstance, InMemoryStore, StorageError, UpdateStore};
pub use types::{
    DeploymentId, DeploymentUpdate, DeploymentUpdateId, ExecutionId, InstanceId, InstanceState,
    NodeInstance, StateTransition, TopologyRef, UpdatePhase, UpdateState, VersionedTopology,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving deployment updates
    pub use crate::{
        AdmissionRejection, DeploymentId, DeploymentUpdate, EngineConfig, EngineError,
        ExecutionEvent, ExecutionStatus, InMemoryStore, SubmitOptions, UpdateEngine, UpdateState,
        UpdateStore, WorkflowExecutor,
    };
    pub use depup_topology::Topology;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
