//! Workflow executor seam
//!
//! The engine never runs lifecycle operations itself. It hands an ordered
//! [`ExecutionRequest`] to a [`WorkflowExecutor`] and later receives
//! [`ExecutionEvent`]s carrying the token it issued.

use crate::config::RetryPolicy;
use crate::types::{DeploymentId, DeploymentUpdateId, ExecutionId, InstanceId};
use async_trait::async_trait;
use depup_topology::{EntityId, EntityType};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Opaque secret binding an execution to the update that started it
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionToken(String);

impl ExecutionToken {
    /// 256 random bits, hex encoded
    #[must_use]
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 32]>()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

// Tokens stay out of logs.
impl fmt::Debug for ExecutionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutionToken(..)")
    }
}

/// What a lifecycle operation does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Create, configure and start a new instance
    Install,
    /// Stop and delete an instance
    Uninstall,
    /// Uninstall then install a live instance with its new configuration
    Reinstall,
    /// Apply a node, property, operation or top-level section change
    Apply,
    /// Run relationship establish operations
    Establish,
    /// Run relationship unlink operations
    Unlink,
}

impl Display for LifecycleAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Reinstall => "reinstall",
            Self::Apply => "apply",
            Self::Establish => "establish",
            Self::Unlink => "unlink",
        })
    }
}

/// One ordered unit of work for the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOperation {
    /// Position in the request, dense from zero
    pub sequence: u32,
    /// Plan step this operation comes from
    pub step_index: u32,
    pub action: LifecycleAction,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Instance subgraph this operation belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

/// Everything the executor needs to run an update workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Issued by the engine and already resolvable to the update
    pub execution_id: ExecutionId,
    pub deployment_id: DeploymentId,
    pub update_id: DeploymentUpdateId,
    pub workflow: String,
    pub token: ExecutionToken,
    pub operations: Vec<LifecycleOperation>,
    pub retry_policy: RetryPolicy,
}

/// Progress reported by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    /// An operation failed and will be retried
    OperationRetrying { sequence: u32, attempt: u32 },
    /// An instance subgraph is being rolled back and retried
    SubgraphRetrying { instance_id: InstanceId, attempt: u32 },
    /// All operations succeeded
    Terminated,
    /// Retries exhausted or a non-retryable failure
    Failed { error: String },
    Cancelled,
}

impl ExecutionStatus {
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed { .. } | Self::Cancelled)
    }
}

/// Status notification for one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub token: ExecutionToken,
    pub status: ExecutionStatus,
}

/// Executor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution rejected: {0}")]
    Rejected(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
}

impl ExecutorError {
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Runs update workflows
///
/// The execution id and token in a request are persisted before
/// [`submit_execution`](Self::submit_execution) is called, so events may be
/// delivered as soon as the call starts.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    /// Queue the workflow described by `request`
    async fn submit_execution(&self, request: ExecutionRequest) -> Result<(), ExecutorError>;

    /// Ask a running execution to stop; a `Cancelled` event follows
    async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<(), ExecutorError>;
}
