//! Admission control through the engine

use async_trait::async_trait;
use depup_core::prelude::*;
use depup_core::{
    CreatedInstance, DeploymentUpdateId, ExecutionId, InstanceId, NodeInstance, StorageError,
    StorageRetryPolicy, VersionedTopology,
};
use depup_planner::LiveState;
use depup_test_utils::{harness, web_db, ScriptedExecutor};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_admit_exactly_one() {
    let h = Arc::new(harness(web_db().build()));
    let handles: Vec<_> = (2..10)
        .map(|n| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.submit(web_db().instances("web", 1, None, n).build()).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(update) => {
                assert_eq!(update.state, UpdateState::ExecutingWorkflow);
                admitted += 1;
            }
            Err(err) => assert!(
                matches!(err, EngineError::Rejected(AdmissionRejection::UpdateInProgress { .. })),
                "unexpected error: {err}"
            ),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(h.engine.list_updates(&h.deployment).await.unwrap().len(), 1);
}

#[tokio::test]
async fn running_execution_blocks_updates() {
    let h = harness(web_db().build());
    let execution = ExecutionId::new();
    h.store.begin_execution(&h.deployment, &execution).await.unwrap();

    let err = h
        .submit(web_db().property("web", "port", json!(1)).build())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Rejected(AdmissionRejection::ExecutionInProgress { execution: e }) if e == execution
    ));
}

#[tokio::test]
async fn locked_deployment_is_rejected() {
    let h = harness(web_db().build());
    h.store.set_locked(&h.deployment, true).unwrap();
    let err = h.submit(web_db().node("extra", "t").build()).await.unwrap_err();
    assert!(matches!(err, EngineError::Rejected(AdmissionRejection::DeploymentLocked)));
}

#[tokio::test]
async fn unknown_deployment_is_rejected() {
    let h = harness(web_db().build());
    let err = h
        .engine
        .submit_update(&DeploymentId::new("ghost"), web_db().build())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(AdmissionRejection::DeploymentNotFound)));
}

#[tokio::test]
async fn terminal_update_frees_the_deployment() {
    let h = harness(web_db().build());
    let first = h
        .submit(web_db().output("a", json!(1)).build())
        .await
        .unwrap();
    assert!(matches!(
        h.submit(web_db().output("b", json!(2)).build()).await,
        Err(EngineError::Rejected(AdmissionRejection::UpdateInProgress { active })) if active == first.id
    ));

    h.report(&first, ExecutionStatus::Terminated).await.unwrap();
    let second = h
        .submit(web_db().output("a", json!(1)).output("b", json!(2)).build())
        .await
        .unwrap();
    assert_eq!(second.old_topology_ref.version, 2);
}

#[tokio::test]
async fn force_replaces_an_update_whose_execution_vanished() {
    let h = harness(web_db().build());
    let stale = h
        .submit(web_db().output("a", json!(1)).build())
        .await
        .unwrap();

    // Force never overrides a running execution.
    let err = h
        .engine
        .submit_update_with(
            &h.deployment,
            web_db().output("b", json!(2)).build(),
            SubmitOptions::forced(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(AdmissionRejection::UpdateInProgress { .. })));

    h.store
        .end_execution(&h.deployment, &stale.execution_id.unwrap())
        .await
        .unwrap();
    let fresh = h
        .engine
        .submit_update_with(
            &h.deployment,
            web_db().output("b", json!(2)).build(),
            SubmitOptions::forced(),
        )
        .await
        .unwrap();
    assert_eq!(fresh.state, UpdateState::ExecutingWorkflow);

    let stale = h.engine.get_update(&stale.id).await.unwrap();
    assert_eq!(stale.state, UpdateState::Failed);

    // Late events for the superseded update change nothing.
    let late = h.report(&stale, ExecutionStatus::Terminated).await.unwrap();
    assert_eq!(late.state, UpdateState::Failed);
    assert_eq!(h.store.get_topology(&h.deployment).await.unwrap().version, 1);
}

/// Store that bumps the `web` node version right after admission
struct RacingStore {
    inner: InMemoryStore,
}

#[async_trait]
impl UpdateStore for RacingStore {
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
        let deployment_id = record.deployment_id.clone();
        let admitted = self.inner.create_deployment_update(record, force).await?;
        let web = self.inner.list_instances(&deployment_id, "web").await?;
        self.inner.delete_instance(&web[0].id).await?;
        Ok(admitted)
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

#[tokio::test]
async fn live_state_moving_during_preparation_fails_the_update() {
    let inner = InMemoryStore::new();
    let deployment = DeploymentId::new("dep-1");
    inner.seed_deployment(deployment.clone(), web_db().build());
    let store = Arc::new(RacingStore { inner });
    let executor = Arc::new(ScriptedExecutor::new());
    let config = EngineConfig::default().with_storage_retry(StorageRetryPolicy {
        attempts: 1,
        backoff_ms: 1,
    });
    let engine = UpdateEngine::new(Arc::clone(&store), Arc::clone(&executor), config);

    let err = engine
        .submit_update(&deployment, web_db().instances("web", 1, None, 3).build())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VersionConflict(_)));
    assert!(err.is_retryable());

    let records = engine.list_updates(&deployment).await.unwrap();
    assert_eq!(records[0].state, UpdateState::Failed);
    assert!(records[0].added_instances.is_empty());
    assert!(executor.submissions().is_empty());
    assert_eq!(store.inner.active_update(&deployment), None);
}

