//! In-memory [`UpdateStore`] on `DashMap`
//!
//! Lock order is deployments, then updates, then instances. A guard on a
//! later map is never held while locking an earlier one.

use super::{CreatedInstance, StorageError, UpdateStore};
use crate::gatekeeper::AdmissionRejection;
use crate::state_machine;
use crate::types::{
    DeploymentId, DeploymentUpdate, DeploymentUpdateId, ExecutionId, InstanceId, InstanceState,
    NodeInstance, UpdateState, VersionedTopology,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use depup_planner::{LiveNode, LiveState};
use depup_topology::Topology;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

#[derive(Debug)]
struct DeploymentRow {
    topology: Topology,
    version: u64,
    locked: bool,
    nodes: BTreeMap<String, NodeRow>,
    active_update: Option<DeploymentUpdateId>,
    active_execution: Option<ExecutionId>,
}

#[derive(Debug, Default)]
struct NodeRow {
    version: u64,
    instances: BTreeSet<InstanceId>,
}

/// Store backed by concurrent hash maps
#[derive(Debug, Default)]
pub struct InMemoryStore {
    deployments: DashMap<DeploymentId, DeploymentRow>,
    updates: DashMap<DeploymentUpdateId, DeploymentUpdate>,
    executions: DashMap<ExecutionId, DeploymentUpdateId>,
    instances: DashMap<InstanceId, NodeInstance>,
    sequence: AtomicU64,
    faults: Mutex<VecDeque<StorageError>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `topology` as deployment version 1 with started instances
    ///
    /// Each node gets as many instances as its bounds target. Replaces any
    /// existing deployment with the same id.
    pub fn seed_deployment(&self, deployment_id: DeploymentId, topology: Topology) {
        let mut nodes = BTreeMap::new();
        for (node_id, spec) in topology.nodes() {
            let mut row = NodeRow {
                version: 1,
                instances: BTreeSet::new(),
            };
            for _ in 0..spec.instances.target() {
                let id = self.next_instance_id(node_id);
                self.instances.insert(
                    id.clone(),
                    NodeInstance {
                        id: id.clone(),
                        deployment_id: deployment_id.clone(),
                        node_id: node_id.clone(),
                        state: InstanceState::Started,
                        runtime_properties: Map::new(),
                        version: 1,
                    },
                );
                row.instances.insert(id);
            }
            nodes.insert(node_id.clone(), row);
        }
        self.deployments.insert(
            deployment_id,
            DeploymentRow {
                topology,
                version: 1,
                locked: false,
                nodes,
                active_update: None,
                active_execution: None,
            },
        );
    }

    /// Lock or unlock a deployment against new updates
    ///
    /// # Errors
    /// [`StorageError::NotFound`] for an unknown deployment.
    pub fn set_locked(&self, deployment_id: &DeploymentId, locked: bool) -> Result<(), StorageError> {
        let mut row = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| StorageError::not_found("deployment", deployment_id))?;
        row.locked = locked;
        Ok(())
    }

    /// Fail the next storage call with `error`
    ///
    /// Faults queue up and are consumed one per call.
    pub fn inject_fault(&self, error: StorageError) {
        self.faults.lock().push_back(error);
    }

    #[must_use]
    pub fn instance(&self, instance_id: &InstanceId) -> Option<NodeInstance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    #[must_use]
    pub fn active_update(&self, deployment_id: &DeploymentId) -> Option<DeploymentUpdateId> {
        self.deployments
            .get(deployment_id)
            .and_then(|row| row.active_update.clone())
    }

    #[must_use]
    pub fn active_execution(&self, deployment_id: &DeploymentId) -> Option<ExecutionId> {
        self.deployments.get(deployment_id).and_then(|row| row.active_execution)
    }

    fn take_fault(&self) -> Result<(), StorageError> {
        match self.faults.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_instance_id(&self, node_id: &str) -> InstanceId {
        InstanceId::new(node_id, self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn deployment_not_found(deployment_id: &DeploymentId) -> StorageError {
        StorageError::not_found("deployment", deployment_id)
    }

    /// Mark a stale active update failed on behalf of `superseded_by`
    fn fail_stale(
        &self,
        active: &DeploymentUpdateId,
        superseded_by: &DeploymentUpdateId,
    ) -> Result<(), StorageError> {
        let Some(mut stale) = self.updates.get_mut(active) else {
            return Ok(());
        };
        if stale.is_terminal() {
            return Ok(());
        }
        state_machine::transition(&mut *stale, UpdateState::Failed, Utc::now())
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        stale.error = Some(format!("superseded by forced update {superseded_by}"));
        stale.version += 1;
        warn!(
            update_id = %active,
            superseded_by = %superseded_by,
            "stale deployment update failed by forced submission"
        );
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for InMemoryStore {
    async fn get_topology(&self, deployment_id: &DeploymentId) -> Result<VersionedTopology, StorageError> {
        self.take_fault()?;
        let row = self
            .deployments
            .get(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        Ok(VersionedTopology {
            topology: row.topology.clone(),
            version: row.version,
        })
    }

    async fn live_state(&self, deployment_id: &DeploymentId) -> Result<LiveState, StorageError> {
        self.take_fault()?;
        let row = self
            .deployments
            .get(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        Ok(row
            .nodes
            .iter()
            .map(|(id, node)| {
                let live = u32::try_from(node.instances.len()).unwrap_or(u32::MAX);
                (id.clone(), LiveNode::new(node.version, live))
            })
            .collect())
    }

    async fn commit_topology(
        &self,
        deployment_id: &DeploymentId,
        topology: &Topology,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.take_fault()?;
        let mut guard = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        let row = &mut *guard;
        if row.version != expected_version {
            return Err(StorageError::VersionConflict {
                entity: format!("deployment {deployment_id}"),
                expected: expected_version,
                actual: row.version,
            });
        }
        row.topology = topology.clone();
        row.version += 1;
        row.nodes
            .retain(|id, node| topology.node(id).is_some() || !node.instances.is_empty());
        for id in topology.nodes().keys() {
            row.nodes.entry(id.clone()).or_insert_with(|| NodeRow {
                version: 1,
                instances: BTreeSet::new(),
            });
        }
        Ok(row.version)
    }

    async fn create_deployment_update(
        &self,
        mut record: DeploymentUpdate,
        force: bool,
    ) -> Result<DeploymentUpdate, StorageError> {
        self.take_fault()?;
        // Held for the whole check-and-insert.
        let mut row = self
            .deployments
            .get_mut(&record.deployment_id)
            .ok_or(StorageError::Rejected(AdmissionRejection::DeploymentNotFound))?;

        if row.locked {
            return Err(StorageError::Rejected(AdmissionRejection::DeploymentLocked));
        }
        if let Some(active) = row.active_update.clone() {
            if !force || row.active_execution.is_some() {
                return Err(StorageError::Rejected(AdmissionRejection::UpdateInProgress {
                    active,
                }));
            }
            self.fail_stale(&active, &record.id)?;
            row.active_update = None;
        }
        if let Some(execution) = row.active_execution {
            return Err(StorageError::Rejected(AdmissionRejection::ExecutionInProgress {
                execution,
            }));
        }
        if self.updates.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists {
                kind: "deployment update",
                id: record.id.to_string(),
            });
        }

        record.version = 1;
        if !record.is_terminal() {
            row.active_update = Some(record.id.clone());
        }
        self.updates.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_deployment_update(&self, id: &DeploymentUpdateId) -> Result<DeploymentUpdate, StorageError> {
        self.take_fault()?;
        self.updates
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| StorageError::not_found("deployment update", id))
    }

    async fn list_deployment_updates(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentUpdate>, StorageError> {
        self.take_fault()?;
        let mut records: Vec<DeploymentUpdate> = self
            .updates
            .iter()
            .filter(|r| r.deployment_id == *deployment_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(records)
    }

    async fn find_update_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<DeploymentUpdate, StorageError> {
        self.take_fault()?;
        let update_id = self
            .executions
            .get(execution_id)
            .map(|id| id.clone())
            .ok_or_else(|| StorageError::not_found("execution", execution_id))?;
        self.updates
            .get(&update_id)
            .map(|r| r.clone())
            .ok_or_else(|| StorageError::not_found("deployment update", &update_id))
    }

    async fn update_deployment_update(
        &self,
        record: &DeploymentUpdate,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.take_fault()?;
        let new_version = {
            let mut stored = self
                .updates
                .get_mut(&record.id)
                .ok_or_else(|| StorageError::not_found("deployment update", &record.id))?;
            if stored.is_terminal() {
                return Err(StorageError::Immutable(record.id.clone()));
            }
            if stored.version != expected_version {
                return Err(StorageError::VersionConflict {
                    entity: format!("deployment update {}", record.id),
                    expected: expected_version,
                    actual: stored.version,
                });
            }
            let mut next = record.clone();
            next.version = expected_version + 1;
            *stored = next;
            expected_version + 1
        };

        if let Some(execution_id) = record.execution_id {
            self.executions.insert(execution_id, record.id.clone());
        }
        if record.is_terminal() {
            if let Some(mut row) = self.deployments.get_mut(&record.deployment_id) {
                if row.active_update.as_ref() == Some(&record.id) {
                    row.active_update = None;
                }
            }
        }
        Ok(new_version)
    }

    async fn begin_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError> {
        self.take_fault()?;
        let mut row = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        match row.active_execution {
            Some(current) if current != *execution_id => {
                Err(StorageError::Rejected(AdmissionRejection::ExecutionInProgress {
                    execution: current,
                }))
            }
            _ => {
                row.active_execution = Some(*execution_id);
                Ok(())
            }
        }
    }

    async fn end_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError> {
        self.take_fault()?;
        let mut row = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        if row.active_execution == Some(*execution_id) {
            row.active_execution = None;
        }
        Ok(())
    }

    async fn create_instance(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
        expected_node_version: Option<u64>,
    ) -> Result<CreatedInstance, StorageError> {
        self.take_fault()?;
        let mut guard = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| Self::deployment_not_found(deployment_id))?;
        let row = &mut *guard;

        match (row.nodes.get(node_id), expected_node_version) {
            (Some(node), Some(expected)) if node.version != expected => {
                return Err(StorageError::VersionConflict {
                    entity: format!("node {node_id}"),
                    expected,
                    actual: node.version,
                });
            }
            (Some(_), None) => {
                return Err(StorageError::AlreadyExists {
                    kind: "node",
                    id: node_id.to_string(),
                });
            }
            (None, Some(_)) => return Err(StorageError::not_found("node", node_id)),
            _ => {}
        }

        let instance_id = self.next_instance_id(node_id);
        let node = row.nodes.entry(node_id.to_string()).or_default();
        node.instances.insert(instance_id.clone());
        node.version += 1;
        let node_version = node.version;

        self.instances.insert(
            instance_id.clone(),
            NodeInstance {
                id: instance_id.clone(),
                deployment_id: deployment_id.clone(),
                node_id: node_id.to_string(),
                state: InstanceState::Uninitialized,
                runtime_properties: Map::new(),
                version: 1,
            },
        );
        Ok(CreatedInstance {
            instance_id,
            node_version,
        })
    }

    async fn list_instances(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
    ) -> Result<Vec<NodeInstance>, StorageError> {
        self.take_fault()?;
        let mut instances: Vec<NodeInstance> = self
            .instances
            .iter()
            .filter(|i| i.deployment_id == *deployment_id && i.node_id == node_id)
            .map(|i| i.clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        runtime_properties: Map<String, Value>,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.take_fault()?;
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| StorageError::not_found("node instance", instance_id))?;
        if instance.version != expected_version {
            return Err(StorageError::VersionConflict {
                entity: format!("node instance {instance_id}"),
                expected: expected_version,
                actual: instance.version,
            });
        }
        instance.runtime_properties = runtime_properties;
        instance.version += 1;
        Ok(instance.version)
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<(), StorageError> {
        self.take_fault()?;
        let (_, instance) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| StorageError::not_found("node instance", instance_id))?;
        if let Some(mut row) = self.deployments.get_mut(&instance.deployment_id) {
            if let Some(node) = row.nodes.get_mut(&instance.node_id) {
                if node.instances.remove(instance_id) {
                    node.version += 1;
                }
            }
        }
        Ok(())
    }
}
