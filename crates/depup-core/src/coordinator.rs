//! Execution coordination
//!
//! Translates a record's ordered steps into lifecycle operations, submits
//! them to the [`WorkflowExecutor`] under an engine-issued id and token, and
//! interprets the events that come back.

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::EngineError;
use crate::executor::{
    ExecutionEvent, ExecutionRequest, ExecutionStatus, ExecutionToken, ExecutorError,
    LifecycleAction, LifecycleOperation, WorkflowExecutor,
};
use crate::storage::StorageError;
use crate::types::{DeploymentUpdate, ExecutionId, InstanceId};
use depup_planner::{bucket_of, Bucket, Step};
use depup_topology::{ChangeOperation, EntityType, Topology};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Instances the engine bound to each node before submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceAssignment {
    /// Placeholders created for positive deltas
    pub added: BTreeMap<String, Vec<InstanceId>>,
    /// Instances selected for deletion
    pub removed: BTreeMap<String, Vec<InstanceId>>,
    /// Live instances of modified nodes that survive the update
    pub reinstalled: BTreeMap<String, Vec<InstanceId>>,
}

impl InstanceAssignment {
    fn of<'a>(map: &'a BTreeMap<String, Vec<InstanceId>>, node: &str) -> &'a [InstanceId] {
        map.get(node).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Identity of an execution, issued before it is submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub token: ExecutionToken,
}

impl ExecutionHandle {
    /// Fresh execution id and token
    #[must_use]
    pub fn issue() -> Self {
        Self {
            execution_id: ExecutionId::new(),
            token: ExecutionToken::generate(),
        }
    }
}

/// What an event means for the update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Still running, retries included
    Progress,
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Failure of a storage write performed on behalf of a running operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The executor should retry the operation under its retry policy
    #[error("operation failed and may be retried: {0}")]
    Retryable(StorageError),

    #[error("operation failed: {0}")]
    Fatal(StorageError),
}

impl OperationError {
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<StorageError> for OperationError {
    fn from(err: StorageError) -> Self {
        if err.is_version_conflict() || err.is_transient() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err)
        }
    }
}

/// Drives one update's workflow through the executor
pub struct ExecutionCoordinator<E: ?Sized> {
    executor: Arc<E>,
    retry_policy: RetryPolicy,
    reinstall_on_modify: bool,
    workflow: String,
}

impl<E: WorkflowExecutor + ?Sized> ExecutionCoordinator<E> {
    #[must_use]
    pub fn new(executor: Arc<E>, config: &EngineConfig) -> Self {
        Self {
            executor,
            retry_policy: config.retry_policy,
            reinstall_on_modify: config.reinstall_on_modify,
            workflow: config.update_workflow.clone(),
        }
    }

    #[inline]
    #[must_use]
    pub fn reinstall_on_modify(&self) -> bool {
        self.reinstall_on_modify
    }

    /// Ordered lifecycle operations for `record`
    ///
    /// Follows the plan's buckets. Node removals run dependents first
    /// (by the relationships in `old`), node additions run relationship
    /// targets first (by the relationships in the new topology).
    #[must_use]
    pub fn build_operations(
        &self,
        record: &DeploymentUpdate,
        old: &Topology,
        assignment: &InstanceAssignment,
    ) -> Vec<LifecycleOperation> {
        let mut list = OperationList::default();
        let steps = &record.steps;

        for step in steps_in(steps, Bucket::RemoveRelationship) {
            list.push(step, LifecycleAction::Unlink, None);
        }

        let removed_nodes = steps_in(steps, Bucket::RemoveNode).collect();
        for step in dependency_order(removed_nodes, &old.relationship_edges(), false) {
            for id in InstanceAssignment::of(&assignment.removed, step.entity_id.as_str()) {
                list.push(step, LifecycleAction::Uninstall, Some(id.clone()));
            }
        }

        let mut modified_nodes: BTreeMap<&str, &Step> = BTreeMap::new();
        for step in steps_in(steps, Bucket::Mutate) {
            list.push(step, LifecycleAction::Apply, None);
            if step.is(ChangeOperation::Modify, EntityType::Node) {
                let node = step.entity_id.as_str();
                for id in InstanceAssignment::of(&assignment.removed, node) {
                    list.push(step, LifecycleAction::Uninstall, Some(id.clone()));
                }
                for id in InstanceAssignment::of(&assignment.added, node) {
                    list.push(step, LifecycleAction::Install, Some(id.clone()));
                }
            }
            if matches!(step.entity_type, EntityType::Property | EntityType::Operation) {
                if let Some(node) = step.owning_node() {
                    modified_nodes.entry(node).or_insert(step);
                }
            }
        }
        if self.reinstall_on_modify {
            for (node, step) in modified_nodes {
                for id in InstanceAssignment::of(&assignment.reinstalled, node) {
                    list.push(step, LifecycleAction::Reinstall, Some(id.clone()));
                }
            }
        }

        let added_nodes = steps_in(steps, Bucket::AddNode).collect();
        for step in dependency_order(added_nodes, &record.new_topology.relationship_edges(), true) {
            for id in InstanceAssignment::of(&assignment.added, step.entity_id.as_str()) {
                list.push(step, LifecycleAction::Install, Some(id.clone()));
            }
        }

        for step in steps_in(steps, Bucket::AddRelationship) {
            list.push(step, LifecycleAction::Establish, None);
        }

        list.ops
    }

    /// Submit `operations` as the execution identified by `handle`
    ///
    /// # Errors
    /// Propagates [`ExecutorError`] from the executor.
    pub async fn start(
        &self,
        record: &DeploymentUpdate,
        handle: &ExecutionHandle,
        operations: Vec<LifecycleOperation>,
    ) -> Result<(), ExecutorError> {
        let operation_count = operations.len();
        let request = ExecutionRequest {
            execution_id: handle.execution_id,
            deployment_id: record.deployment_id.clone(),
            update_id: record.id.clone(),
            workflow: self.workflow.clone(),
            token: handle.token.clone(),
            operations,
            retry_policy: self.retry_policy,
        };
        self.executor.submit_execution(request).await?;
        info!(
            update_id = %record.id,
            execution_id = %handle.execution_id,
            workflow = %self.workflow,
            operations = operation_count,
            "update workflow submitted"
        );
        Ok(())
    }

    /// Request cancellation of a running execution
    ///
    /// # Errors
    /// Propagates [`ExecutorError`] from the executor.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<(), ExecutorError> {
        self.executor.cancel_execution(execution_id).await
    }

    /// Verify `event` belongs to `record` and classify it
    ///
    /// # Errors
    /// - [`EngineError::UnknownExecution`] if the record does not own the execution
    /// - [`EngineError::InvalidExecutionToken`] if the token does not match
    pub fn interpret(
        &self,
        record: &DeploymentUpdate,
        event: &ExecutionEvent,
    ) -> Result<EventOutcome, EngineError> {
        if record.execution_id != Some(event.execution_id) {
            return Err(EngineError::UnknownExecution(event.execution_id));
        }
        if record.execution_token.as_ref() != Some(&event.token) {
            warn!(
                update_id = %record.id,
                execution_id = %event.execution_id,
                "execution event with invalid token"
            );
            return Err(EngineError::InvalidExecutionToken(event.execution_id));
        }

        let outcome = match &event.status {
            ExecutionStatus::Started => {
                debug!(update_id = %record.id, "update workflow started");
                EventOutcome::Progress
            }
            ExecutionStatus::OperationRetrying { sequence, attempt } => {
                info!(update_id = %record.id, sequence, attempt, "operation retrying");
                EventOutcome::Progress
            }
            ExecutionStatus::SubgraphRetrying {
                instance_id,
                attempt,
            } => {
                warn!(update_id = %record.id, %instance_id, attempt, "instance subgraph retrying");
                EventOutcome::Progress
            }
            ExecutionStatus::Terminated => EventOutcome::Succeeded,
            ExecutionStatus::Failed { error } => EventOutcome::Failed(error.clone()),
            ExecutionStatus::Cancelled => EventOutcome::Cancelled,
        };
        Ok(outcome)
    }
}

#[derive(Default)]
struct OperationList {
    ops: Vec<LifecycleOperation>,
}

impl OperationList {
    fn push(&mut self, step: &Step, action: LifecycleAction, instance_id: Option<InstanceId>) {
        let sequence = u32::try_from(self.ops.len()).unwrap_or(u32::MAX);
        self.ops.push(LifecycleOperation {
            sequence,
            step_index: step.sequence_index,
            action,
            entity_type: step.entity_type,
            entity_id: step.entity_id.clone(),
            node_id: step.owning_node().map(str::to_string),
            instance_id,
        });
    }
}

fn steps_in(steps: &[Step], bucket: Bucket) -> impl Iterator<Item = &Step> {
    steps
        .iter()
        .filter(move |s| bucket_of(s.entity_type, s.operation) == bucket)
}

/// Order node steps along relationship edges
///
/// `targets_first` puts relationship targets before their sources; otherwise
/// sources (dependents) come first. Falls back to id order on a cycle.
fn dependency_order<'a>(
    steps: Vec<&'a Step>,
    edges: &[(&str, &str)],
    targets_first: bool,
) -> Vec<&'a Step> {
    let by_node: BTreeMap<&'a str, &'a Step> =
        steps.into_iter().map(|s| (s.entity_id.as_str(), s)).collect();

    let mut graph: DiGraphMap<&'a str, ()> = DiGraphMap::new();
    for node in by_node.keys() {
        graph.add_node(*node);
    }
    for &(source, target) in edges {
        if let (Some((&source, _)), Some((&target, _))) =
            (by_node.get_key_value(source), by_node.get_key_value(target))
        {
            if targets_first {
                graph.add_edge(target, source, ());
            } else {
                graph.add_edge(source, target, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order
            .into_iter()
            .filter_map(|node| by_node.get(node).copied())
            .collect(),
        Err(cycle) => {
            warn!(node = cycle.node_id(), "relationship cycle, ordering by node id");
            by_node.into_values().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeploymentId, TopologyRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use depup_planner::{LiveNode, LiveState, Planner};
    use depup_topology::diff;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct NullExecutor;

    #[async_trait]
    impl WorkflowExecutor for NullExecutor {
        async fn submit_execution(&self, _: ExecutionRequest) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn cancel_execution(&self, _: &ExecutionId) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn coordinator(reinstall: bool) -> ExecutionCoordinator<NullExecutor> {
        ExecutionCoordinator::new(
            Arc::new(NullExecutor),
            &EngineConfig::default().with_reinstall_on_modify(reinstall),
        )
    }

    fn topology(value: Value) -> Topology {
        Topology::from_value(value).unwrap()
    }

    fn record(old: &Topology, new: &Topology) -> DeploymentUpdate {
        let live: LiveState = old
            .nodes()
            .iter()
            .map(|(id, node)| (id.clone(), LiveNode::new(1, node.instances.target())))
            .collect();
        let plan = Planner::new().plan(&diff(old, new), &live).unwrap();
        let deployment = DeploymentId::new("dep-1");
        DeploymentUpdate::new(
            deployment.clone(),
            TopologyRef {
                deployment_id: deployment,
                version: 1,
                hash: old.hash(),
            },
            new.clone(),
            plan,
            Utc::now(),
        )
    }

    fn ids(node: &str, n: u64) -> Vec<InstanceId> {
        (1..=n).map(|i| InstanceId::new(node, i)).collect()
    }

    fn summary(ops: &[LifecycleOperation]) -> Vec<String> {
        ops.iter()
            .map(|op| match &op.instance_id {
                Some(id) => format!("{} {}", op.action, id),
                None => format!("{} {}", op.action, op.entity_id),
            })
            .collect()
    }

    #[test]
    fn added_nodes_install_targets_first() {
        let old = topology(json!({"nodes": {}}));
        let new = topology(json!({"nodes": {
            "app": {"type": "app", "relationships": [{"type": "contained_in", "target_id": "vm"}]},
            "vm": {"type": "vm"},
        }}));
        let record = record(&old, &new);
        let assignment = InstanceAssignment {
            added: BTreeMap::from([
                ("app".to_string(), ids("app", 1)),
                ("vm".to_string(), ids("vm", 1)),
            ]),
            ..InstanceAssignment::default()
        };

        let ops = coordinator(true).build_operations(&record, &old, &assignment);
        assert_eq!(summary(&ops), vec!["install vm_000001", "install app_000001"]);
        assert!(ops.iter().enumerate().all(|(i, op)| op.sequence as usize == i));
    }

    #[test]
    fn removals_unlink_then_uninstall_dependents_first() {
        let old = topology(json!({"nodes": {
            "a_vm": {"type": "vm"},
            "b_app": {"type": "app", "relationships": [{"type": "contained_in", "target_id": "a_vm"}]},
            "keep": {"type": "app", "relationships": [{"type": "connected_to", "target_id": "b_app"}]},
        }}));
        let new = topology(json!({"nodes": {"keep": {"type": "app"}}}));
        let record = record(&old, &new);
        let assignment = InstanceAssignment {
            removed: BTreeMap::from([
                ("a_vm".to_string(), ids("a_vm", 1)),
                ("b_app".to_string(), ids("b_app", 1)),
            ]),
            ..InstanceAssignment::default()
        };

        let ops = coordinator(true).build_operations(&record, &old, &assignment);
        assert_eq!(
            summary(&ops),
            vec!["unlink keep::b_app", "uninstall b_app_000001", "uninstall a_vm_000001"]
        );
    }

    #[test]
    fn property_change_reinstalls_live_instances() {
        let old = topology(json!({"nodes": {"web": {"type": "server", "properties": {"port": 80}}}}));
        let new = topology(json!({"nodes": {"web": {"type": "server", "properties": {"port": 8080}}}}));
        let record = record(&old, &new);
        let assignment = InstanceAssignment {
            reinstalled: BTreeMap::from([("web".to_string(), ids("web", 2))]),
            ..InstanceAssignment::default()
        };

        let ops = coordinator(true).build_operations(&record, &old, &assignment);
        assert_eq!(
            summary(&ops),
            vec![
                "apply web.properties.port",
                "reinstall web_000001",
                "reinstall web_000002"
            ]
        );

        let ops = coordinator(false).build_operations(&record, &old, &assignment);
        assert_eq!(summary(&ops), vec!["apply web.properties.port"]);
    }

    #[test]
    fn scaling_a_node_installs_and_uninstalls_in_place() {
        let old = topology(json!({"nodes": {"web": {"type": "server", "instances": {"default": 1}}}}));
        let new = topology(json!({"nodes": {"web": {"type": "server", "instances": {"default": 2}}}}));
        let record = record(&old, &new);
        let assignment = InstanceAssignment {
            added: BTreeMap::from([("web".to_string(), vec![InstanceId::new("web", 9)])]),
            ..InstanceAssignment::default()
        };

        let ops = coordinator(true).build_operations(&record, &old, &assignment);
        assert_eq!(summary(&ops), vec!["apply web", "install web_000009"]);
    }

    #[test]
    fn interpret_checks_ownership_and_token() {
        let old = topology(json!({"nodes": {}}));
        let new = topology(json!({"nodes": {"n1": {"type": "t"}}}));
        let mut record = record(&old, &new);
        let execution_id = ExecutionId::new();
        let token = ExecutionToken::generate();
        record.execution_id = Some(execution_id);
        record.execution_token = Some(token.clone());
        let coordinator = coordinator(true);

        let event = |token: ExecutionToken, status| ExecutionEvent {
            execution_id,
            token,
            status,
        };

        assert_eq!(
            coordinator
                .interpret(&record, &event(token.clone(), ExecutionStatus::Terminated))
                .unwrap(),
            EventOutcome::Succeeded
        );
        assert_eq!(
            coordinator
                .interpret(
                    &record,
                    &event(
                        token.clone(),
                        ExecutionStatus::SubgraphRetrying {
                            instance_id: InstanceId::new("n1", 1),
                            attempt: 1
                        }
                    )
                )
                .unwrap(),
            EventOutcome::Progress
        );
        assert!(matches!(
            coordinator.interpret(&record, &event(ExecutionToken::generate(), ExecutionStatus::Terminated)),
            Err(EngineError::InvalidExecutionToken(id)) if id == execution_id
        ));

        let foreign = ExecutionEvent {
            execution_id: ExecutionId::new(),
            token,
            status: ExecutionStatus::Terminated,
        };
        assert!(matches!(
            coordinator.interpret(&record, &foreign),
            Err(EngineError::UnknownExecution(_))
        ));
    }

    #[test]
    fn storage_conflicts_surface_as_retryable() {
        let conflict = StorageError::VersionConflict {
            entity: "node instance web_000001".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(OperationError::from(conflict).is_retryable());
        assert!(!OperationError::from(StorageError::not_found("node instance", "x")).is_retryable());
    }
}
