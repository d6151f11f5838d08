//! Persistence seam for deployments, update records and node instances
//!
//! Every mutating call that can race takes the version the caller observed
//! and fails with [`StorageError::VersionConflict`] when it moved.

mod memory;

pub use memory::InMemoryStore;

use crate::gatekeeper::AdmissionRejection;
use crate::types::{
    DeploymentId, DeploymentUpdate, DeploymentUpdateId, ExecutionId, InstanceId, NodeInstance,
    VersionedTopology,
};
use async_trait::async_trait;
use depup_planner::LiveState;
use depup_topology::Topology;
use serde_json::{Map, Value};

/// Result of [`UpdateStore::create_instance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance_id: InstanceId,
    /// Node version after the insert
    pub node_version: u64,
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("version conflict on {entity}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Admission check failed inside [`UpdateStore::create_deployment_update`]
    #[error("rejected: {0}")]
    Rejected(AdmissionRejection),

    #[error("deployment update {0} is terminal and cannot be modified")]
    Immutable(DeploymentUpdateId),

    /// Worth retrying
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[inline]
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Storage backend used by the engine
///
/// Implementations must make [`create_deployment_update`](Self::create_deployment_update)
/// a single atomic check-and-insert per deployment.
#[async_trait]
pub trait UpdateStore: Send + Sync + 'static {
    // Deployments

    /// Current topology and deployment version
    async fn get_topology(&self, deployment_id: &DeploymentId) -> Result<VersionedTopology, StorageError>;

    /// Per-node versions and live instance counts
    async fn live_state(&self, deployment_id: &DeploymentId) -> Result<LiveState, StorageError>;

    /// Replace the topology if the deployment is still at `expected_version`
    ///
    /// Returns the new deployment version.
    async fn commit_topology(
        &self,
        deployment_id: &DeploymentId,
        topology: &Topology,
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    // Update records

    /// Admission check and insert in one step
    ///
    /// Fails with [`StorageError::Rejected`] when another update is active, an
    /// execution is running, or the deployment is missing or locked. With
    /// `force`, an active update whose execution is no longer running is
    /// marked `FAILED` first. Terminal records (no changes) are stored without
    /// becoming the active update.
    async fn create_deployment_update(
        &self,
        record: DeploymentUpdate,
        force: bool,
    ) -> Result<DeploymentUpdate, StorageError>;

    async fn get_deployment_update(&self, id: &DeploymentUpdateId) -> Result<DeploymentUpdate, StorageError>;

    /// All updates of a deployment, oldest first
    async fn list_deployment_updates(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentUpdate>, StorageError>;

    async fn find_update_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<DeploymentUpdate, StorageError>;

    /// Overwrite a record if its stored version is `expected_version`
    ///
    /// Returns the new record version. A terminal record releases the
    /// deployment's active-update slot.
    async fn update_deployment_update(
        &self,
        record: &DeploymentUpdate,
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    // Executions

    /// Mark `execution_id` as the deployment's running execution
    async fn begin_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError>;

    /// Clear the running execution if it is `execution_id`
    async fn end_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError>;

    // Node instances

    /// Insert an uninitialized instance of `node_id`
    ///
    /// `expected_node_version` is `None` for a node the deployment does not
    /// have yet, and the node version observed at planning time otherwise.
    async fn create_instance(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
        expected_node_version: Option<u64>,
    ) -> Result<CreatedInstance, StorageError>;

    /// Instances of one node, ordered by id
    async fn list_instances(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
    ) -> Result<Vec<NodeInstance>, StorageError>;

    /// Replace runtime properties if the instance is at `expected_version`
    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        runtime_properties: Map<String, Value>,
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<(), StorageError>;
}
