//! Testing utilities for the depup workspace
//!
//! Topology fixtures, a scripted workflow executor, and a harness wiring an
//! [`UpdateEngine`] to an [`InMemoryStore`].

#![allow(missing_docs)]

use async_trait::async_trait;
use depup_core::{
    CreatedInstance, DeploymentId, DeploymentUpdate, DeploymentUpdateId, EngineConfig,
    EngineError, ExecutionEvent, ExecutionId, ExecutionRequest, ExecutionStatus, ExecutorError,
    InMemoryStore, InstanceId, NodeInstance, StorageError, StorageRetryPolicy, UpdateEngine,
    UpdateState, UpdateStore, VersionedTopology, WorkflowExecutor,
};
use depup_planner::LiveState;
use depup_topology::Topology;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fluent builder for topology documents
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    nodes: Map<String, Value>,
    sections: Map<String, Value>,
}

impl TopologyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with one default instance
    #[must_use]
    pub fn node(mut self, id: &str, node_type: &str) -> Self {
        self.nodes.insert(id.to_string(), json!({ "type": node_type }));
        self
    }

    #[must_use]
    pub fn instances(mut self, node: &str, min: u32, max: Option<u32>, default: u32) -> Self {
        let mut bounds = json!({ "min": min, "default": default });
        if let Some(max) = max {
            bounds["max"] = json!(max);
        }
        self.node_mut(node).insert("instances".to_string(), bounds);
        self
    }

    #[must_use]
    pub fn property(mut self, node: &str, key: &str, value: Value) -> Self {
        self.child_map(node, "properties").insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn operation(mut self, node: &str, key: &str, value: Value) -> Self {
        self.child_map(node, "operations").insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn relationship(mut self, source: &str, rel_type: &str, target: &str) -> Self {
        let relationships = self
            .node_mut(source)
            .entry("relationships")
            .or_insert_with(|| json!([]));
        if let Value::Array(items) = relationships {
            items.push(json!({ "type": rel_type, "target_id": target }));
        }
        self
    }

    #[must_use]
    pub fn output(self, key: &str, value: Value) -> Self {
        self.section("outputs", key, value)
    }

    #[must_use]
    pub fn workflow(self, key: &str, value: Value) -> Self {
        self.section("workflows", key, value)
    }

    #[must_use]
    pub fn group(self, key: &str, value: Value) -> Self {
        self.section("groups", key, value)
    }

    #[must_use]
    pub fn policy(self, key: &str, value: Value) -> Self {
        self.section("policies", key, value)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut raw = self.sections.clone();
        raw.insert("nodes".to_string(), Value::Object(self.nodes.clone()));
        Value::Object(raw)
    }

    /// # Panics
    /// If the document is not a valid topology.
    #[must_use]
    pub fn build(&self) -> Topology {
        Topology::from_value(self.to_value()).expect("builder produced an invalid topology")
    }

    fn section(mut self, name: &str, key: &str, value: Value) -> Self {
        let section = self
            .sections
            .entry(name.to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = section {
            map.insert(key.to_string(), value);
        }
        self
    }

    fn node_mut(&mut self, node: &str) -> &mut Map<String, Value> {
        self.nodes
            .get_mut(node)
            .and_then(Value::as_object_mut)
            .unwrap_or_else(|| panic!("node {node} must be added before it is configured"))
    }

    fn child_map(&mut self, node: &str, key: &str) -> &mut Map<String, Value> {
        self.node_mut(node)
            .entry(key.to_string())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .unwrap_or_else(|| panic!("{node}.{key} is not a mapping"))
    }
}

/// Two-tier fixture: `web` connected to `db`, one instance each
#[must_use]
pub fn web_db() -> TopologyBuilder {
    TopologyBuilder::new()
        .node("db", "database")
        .node("web", "server")
        .property("web", "port", json!(80))
        .relationship("web", "connected_to", "db")
        .output("endpoint", json!({"value": "http://web"}))
}

/// Executor that records submissions and lets tests script events
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    submitted: Mutex<Vec<(ExecutionId, ExecutionRequest)>>,
    cancelled: Mutex<Vec<ExecutionId>>,
    reject: AtomicBool,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following submission fail
    pub fn reject_submissions(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<(ExecutionId, ExecutionRequest)> {
        self.submitted.lock().clone()
    }

    #[must_use]
    pub fn request(&self, execution_id: &ExecutionId) -> Option<ExecutionRequest> {
        self.submitted
            .lock()
            .iter()
            .find(|(id, _)| id == execution_id)
            .map(|(_, request)| request.clone())
    }

    #[must_use]
    pub fn cancelled(&self) -> Vec<ExecutionId> {
        self.cancelled.lock().clone()
    }

    /// Event for `execution_id` carrying the token it was submitted with
    ///
    /// # Panics
    /// If the execution was never submitted.
    #[must_use]
    pub fn event(&self, execution_id: &ExecutionId, status: ExecutionStatus) -> ExecutionEvent {
        let request = self
            .request(execution_id)
            .unwrap_or_else(|| panic!("execution {execution_id} was never submitted"));
        ExecutionEvent {
            execution_id: *execution_id,
            token: request.token,
            status,
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ScriptedExecutor {
    async fn submit_execution(&self, request: ExecutionRequest) -> Result<(), ExecutorError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ExecutorError::Rejected("scripted rejection".to_string()));
        }
        self.submitted.lock().push((request.execution_id, request));
        Ok(())
    }

    async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<(), ExecutorError> {
        if self.request(execution_id).is_none() {
            return Err(ExecutorError::NotFound(*execution_id));
        }
        self.cancelled.lock().push(*execution_id);
        Ok(())
    }
}

/// Engine over an in-memory store and a scripted executor
pub struct Harness {
    pub engine: UpdateEngine<InMemoryStore, ScriptedExecutor>,
    pub store: Arc<InMemoryStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub deployment: DeploymentId,
}

/// Harness with `topology` seeded as deployment `dep-1`
#[must_use]
pub fn harness(topology: Topology) -> Harness {
    let config = EngineConfig::default().with_storage_retry(StorageRetryPolicy {
        attempts: 3,
        backoff_ms: 1,
    });
    harness_with_config(topology, config)
}

#[must_use]
pub fn harness_with_config(topology: Topology, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let deployment = DeploymentId::new("dep-1");
    store.seed_deployment(deployment.clone(), topology);
    Harness {
        engine: UpdateEngine::new(Arc::clone(&store), Arc::clone(&executor), config),
        store,
        executor,
        deployment,
    }
}

impl Harness {
    pub async fn submit(&self, topology: Topology) -> Result<DeploymentUpdate, EngineError> {
        self.engine.submit_update(&self.deployment, topology).await
    }

    /// Deliver `status` for the execution started by `update`
    ///
    /// # Panics
    /// If `update` has no execution.
    pub async fn report(
        &self,
        update: &DeploymentUpdate,
        status: ExecutionStatus,
    ) -> Result<DeploymentUpdate, EngineError> {
        let execution_id = update
            .execution_id
            .expect("update has no execution to report on");
        let event = self.executor.event(&execution_id, status);
        self.engine.on_execution_event(event).await
    }

    /// Request sent to the executor for `update`
    ///
    /// # Panics
    /// If `update` has no execution.
    #[must_use]
    pub fn request_for(&self, update: &DeploymentUpdate) -> ExecutionRequest {
        let execution_id = update
            .execution_id
            .expect("update has no execution");
        self.executor
            .request(&execution_id)
            .expect("execution was submitted")
    }
}

/// In-memory store whose update-record writes can be made to fail
///
/// Writes that would move a record into the armed state fail with
/// [`StorageError::Unavailable`] until the armed count runs out.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    failing: Mutex<Option<(UpdateState, u32)>>,
}

impl FlakyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes of records in `state`
    pub fn fail_writes_into(&self, state: UpdateState, times: u32) {
        *self.failing.lock() = Some((state, times));
    }

    /// Let every following write through
    pub fn heal(&self) {
        *self.failing.lock() = None;
    }

    fn check_write(&self, record: &DeploymentUpdate) -> Result<(), StorageError> {
        let mut failing = self.failing.lock();
        match failing.as_mut() {
            Some((state, remaining)) if *state == record.state && *remaining > 0 => {
                *remaining -= 1;
                Err(StorageError::Unavailable(format!("write of {} refused", record.state)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl UpdateStore for FlakyStore {
    async fn get_topology(&self, deployment_id: &DeploymentId) -> Result<VersionedTopology, StorageError> {
        self.inner.get_topology(deployment_id).await
    }

    async fn live_state(&self, deployment_id: &DeploymentId) -> Result<LiveState, StorageError> {
        self.inner.live_state(deployment_id).await
    }

    async fn commit_topology(
        &self,
        deployment_id: &DeploymentId,
        topology: &Topology,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.inner.commit_topology(deployment_id, topology, expected_version).await
    }

    async fn create_deployment_update(
        &self,
        record: DeploymentUpdate,
        force: bool,
    ) -> Result<DeploymentUpdate, StorageError> {
        self.inner.create_deployment_update(record, force).await
    }

    async fn get_deployment_update(&self, id: &DeploymentUpdateId) -> Result<DeploymentUpdate, StorageError> {
        self.inner.get_deployment_update(id).await
    }

    async fn list_deployment_updates(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentUpdate>, StorageError> {
        self.inner.list_deployment_updates(deployment_id).await
    }

    async fn find_update_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<DeploymentUpdate, StorageError> {
        self.inner.find_update_by_execution(execution_id).await
    }

    async fn update_deployment_update(
        &self,
        record: &DeploymentUpdate,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.check_write(record)?;
        self.inner.update_deployment_update(record, expected_version).await
    }

    async fn begin_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError> {
        self.inner.begin_execution(deployment_id, execution_id).await
    }

    async fn end_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
    ) -> Result<(), StorageError> {
        self.inner.end_execution(deployment_id, execution_id).await
    }

    async fn create_instance(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
        expected_node_version: Option<u64>,
    ) -> Result<CreatedInstance, StorageError> {
        self.inner
            .create_instance(deployment_id, node_id, expected_node_version)
            .await
    }

    async fn list_instances(
        &self,
        deployment_id: &DeploymentId,
        node_id: &str,
    ) -> Result<Vec<NodeInstance>, StorageError> {
        self.inner.list_instances(deployment_id, node_id).await
    }

    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        runtime_properties: Map<String, Value>,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.inner
            .update_instance(instance_id, runtime_properties, expected_version)
            .await
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<(), StorageError> {
        self.inner.delete_instance(instance_id).await
    }
}
