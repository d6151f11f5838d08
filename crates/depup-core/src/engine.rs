//! Deployment update engine
//!
//! Public entry point tying the differ, planner, admission, execution
//! coordinator and storage together.

use crate::config::EngineConfig;
use crate::coordinator::{
    EventOutcome, ExecutionCoordinator, ExecutionHandle, InstanceAssignment, OperationError,
};
use crate::error::EngineError;
use crate::executor::{ExecutionEvent, WorkflowExecutor};
use crate::gatekeeper::{AdmissionRejection, Gatekeeper, SubmitOptions};
use crate::retry::with_storage_retry;
use crate::state_machine;
use crate::storage::{StorageError, UpdateStore};
use crate::types::{
    DeploymentId, DeploymentUpdate, DeploymentUpdateId, InstanceId, TopologyRef, UpdatePhase,
    UpdateState,
};
use chrono::Utc;
use depup_planner::Planner;
use depup_topology::{diff, EntityType, Topology};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Orchestrates deployment updates end to end
pub struct UpdateEngine<S: ?Sized, E: ?Sized> {
    store: Arc<S>,
    gatekeeper: Gatekeeper<S>,
    coordinator: ExecutionCoordinator<E>,
    planner: Planner,
    config: EngineConfig,
}

impl<S, E> UpdateEngine<S, E>
where
    S: UpdateStore + ?Sized,
    E: WorkflowExecutor + ?Sized,
{
    #[must_use]
    pub fn new(store: Arc<S>, executor: Arc<E>, config: EngineConfig) -> Self {
        Self {
            gatekeeper: Gatekeeper::new(Arc::clone(&store), config.storage_retry),
            coordinator: ExecutionCoordinator::new(executor, &config),
            planner: Planner::new().with_payloads(config.include_payloads),
            store,
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Submit `new_topology` as the next version of `deployment_id`
    ///
    /// # Errors
    /// See [`submit_update_with`](Self::submit_update_with).
    pub async fn submit_update(
        &self,
        deployment_id: &DeploymentId,
        new_topology: Topology,
    ) -> Result<DeploymentUpdate, EngineError> {
        self.submit_update_with(deployment_id, new_topology, SubmitOptions::default())
            .await
    }

    /// Diff, plan, admit and start an update
    ///
    /// Returns the record in `EXECUTING_WORKFLOW`, or in
    /// `NO_CHANGES_REQUIRED` when the topology is unchanged.
    ///
    /// # Errors
    /// - [`EngineError::Plan`] for unsupported changes (the update is not recorded)
    /// - [`EngineError::Rejected`] when admission fails
    /// - [`EngineError::VersionConflict`] when live state moved during
    ///   preparation; the update is recorded as `FAILED`
    /// - [`EngineError::Executor`] when submission fails; the update is recorded as `FAILED`
    ///
    /// Executor events may settle the update before this returns; the
    /// returned record reflects the state at submission.
    pub async fn submit_update_with(
        &self,
        deployment_id: &DeploymentId,
        new_topology: Topology,
        options: SubmitOptions,
    ) -> Result<DeploymentUpdate, EngineError> {
        let current = self
            .retry("get_topology", || self.store.get_topology(deployment_id))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    EngineError::Rejected(AdmissionRejection::DeploymentNotFound)
                } else {
                    err.into()
                }
            })?;
        let live = self
            .retry("live_state", || self.store.live_state(deployment_id))
            .await?;

        let changes = diff(&current.topology, &new_topology);
        let plan = self.planner.plan(&changes, &live)?;
        debug!(
            %deployment_id,
            changes = changes.len(),
            steps = plan.steps.len(),
            instance_deltas = plan.instance_deltas.len(),
            "deployment update planned"
        );

        let old_topology_ref = TopologyRef {
            deployment_id: deployment_id.clone(),
            version: current.version,
            hash: current.topology.hash(),
        };
        let record = DeploymentUpdate::new(
            deployment_id.clone(),
            old_topology_ref,
            new_topology,
            plan,
            Utc::now(),
        );
        let record = self.gatekeeper.admit(record, options).await?;
        if record.is_terminal() {
            info!(update_id = %record.id, %deployment_id, "no changes required");
            return Ok(record);
        }

        self.run_workflow(record, &current.topology).await
    }

    /// Fetch one update record
    ///
    /// # Errors
    /// [`EngineError::UpdateNotFound`] for an unknown id.
    pub async fn get_update(&self, update_id: &DeploymentUpdateId) -> Result<DeploymentUpdate, EngineError> {
        self.retry("get_deployment_update", || self.store.get_deployment_update(update_id))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    EngineError::UpdateNotFound(update_id.clone())
                } else {
                    err.into()
                }
            })
    }

    /// All updates of a deployment, oldest first
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn list_updates(&self, deployment_id: &DeploymentId) -> Result<Vec<DeploymentUpdate>, EngineError> {
        Ok(self
            .retry("list_deployment_updates", || {
                self.store.list_deployment_updates(deployment_id)
            })
            .await?)
    }

    /// Ask the executor to stop an update's workflow
    ///
    /// The record becomes `FAILED` when the resulting `Cancelled` event arrives.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] unless the update is in `EXECUTING_WORKFLOW`.
    pub async fn cancel_update(&self, update_id: &DeploymentUpdateId) -> Result<DeploymentUpdate, EngineError> {
        let record = self.get_update(update_id).await?;
        match (record.state, record.execution_id) {
            (UpdateState::ExecutingWorkflow, Some(execution_id)) => {
                self.coordinator.cancel(&execution_id).await?;
                info!(update_id = %record.id, %execution_id, "cancellation requested");
                Ok(record)
            }
            (state, _) => Err(EngineError::InvalidState {
                update_id: record.id,
                state,
                action: "cancel",
            }),
        }
    }

    /// Apply an executor event to the update that owns the execution
    ///
    /// Events for settled updates are ignored. A terminal event for an update
    /// left in `FINALIZING` resumes its finalization.
    ///
    /// # Errors
    /// - [`EngineError::UnknownExecution`] if no update owns the execution
    /// - [`EngineError::InvalidExecutionToken`] if the token does not match
    pub async fn on_execution_event(&self, event: ExecutionEvent) -> Result<DeploymentUpdate, EngineError> {
        let record = self
            .retry("find_update_by_execution", || {
                self.store.find_update_by_execution(&event.execution_id)
            })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    EngineError::UnknownExecution(event.execution_id)
                } else {
                    err.into()
                }
            })?;

        let outcome = self.coordinator.interpret(&record, &event)?;
        match (record.state, outcome) {
            (UpdateState::ExecutingWorkflow | UpdateState::Finalizing, EventOutcome::Progress) => {
                Ok(record)
            }
            (UpdateState::ExecutingWorkflow, EventOutcome::Succeeded) => self.finalize(record).await,
            (UpdateState::ExecutingWorkflow, EventOutcome::Failed(reason)) => {
                self.fail_execution(record, reason).await
            }
            (UpdateState::ExecutingWorkflow, EventOutcome::Cancelled) => {
                self.fail_execution(record, "execution cancelled".to_string())
                    .await
            }
            // The workflow already succeeded; a redelivered terminal event
            // picks up an interrupted finalization.
            (UpdateState::Finalizing, _) => {
                info!(update_id = %record.id, "resuming finalization");
                self.finalize(record).await
            }
            (state, _) => {
                debug!(update_id = %record.id, %state, "ignoring event for settled update");
                Ok(record)
            }
        }
    }

    /// Finish an update whose finalization was interrupted
    ///
    /// Deletes the remaining removed instances, commits the new topology
    /// unless it is already committed, and records the outcome.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] unless the update is in `FINALIZING`.
    pub async fn resume_update(&self, update_id: &DeploymentUpdateId) -> Result<DeploymentUpdate, EngineError> {
        let record = self.get_update(update_id).await?;
        if record.state != UpdateState::Finalizing {
            return Err(EngineError::InvalidState {
                update_id: record.id,
                state: record.state,
                action: "resume",
            });
        }
        info!(update_id = %record.id, "resuming finalization");
        self.finalize(record).await
    }

    /// Persist runtime properties written by a running operation
    ///
    /// # Errors
    /// [`OperationError::Retryable`] on version conflicts, so the executor
    /// retries the operation under its retry policy.
    pub async fn update_instance_runtime(
        &self,
        instance_id: &InstanceId,
        runtime_properties: Map<String, Value>,
        expected_version: u64,
    ) -> Result<u64, OperationError> {
        self.store
            .update_instance(instance_id, runtime_properties, expected_version)
            .await
            .map_err(|err| {
                let err = OperationError::from(err);
                debug!(%instance_id, retryable = err.is_retryable(), error = %err, "runtime update failed");
                err
            })
    }

    async fn run_workflow(
        &self,
        mut record: DeploymentUpdate,
        old: &Topology,
    ) -> Result<DeploymentUpdate, EngineError> {
        let mut assignment = InstanceAssignment::default();
        if let Err(err) = self.prepare_instances(&mut record, &mut assignment).await {
            return Err(self.abort(record, err).await);
        }
        let operations = self.coordinator.build_operations(&record, old, &assignment);

        // Id and token are persisted before submission so that any event the
        // executor sends resolves to this record.
        let handle = ExecutionHandle::issue();
        let registered = self
            .retry("begin_execution", || {
                self.store
                    .begin_execution(&record.deployment_id, &handle.execution_id)
            })
            .await;
        if let Err(err) = registered {
            return Err(self.abort(record, err.into()).await);
        }
        record.execution_id = Some(handle.execution_id);
        record.execution_token = Some(handle.token.clone());
        if let Err(err) = self.transition(&mut record, UpdateState::ExecutingWorkflow).await {
            return Err(self.abort(record, err).await);
        }

        if let Err(err) = self.coordinator.start(&record, &handle, operations).await {
            return Err(self.abort(record, err.into()).await);
        }
        Ok(record)
    }

    /// Create placeholders for additions and pick instances to remove
    async fn prepare_instances(
        &self,
        record: &mut DeploymentUpdate,
        assignment: &mut InstanceAssignment,
    ) -> Result<(), EngineError> {
        let deployment_id = record.deployment_id.clone();
        let deltas: Vec<_> = record
            .instance_deltas
            .iter()
            .map(|(node, delta)| (node.clone(), *delta))
            .collect();

        for (node, delta) in deltas {
            let mut expected = record.expected_versions.get(&node).copied();
            for _ in 0..delta.additions() {
                let created = self
                    .store
                    .create_instance(&deployment_id, &node, expected)
                    .await?;
                expected = Some(created.node_version);
                debug!(update_id = %record.id, instance_id = %created.instance_id, "instance placeholder created");
                assignment
                    .added
                    .entry(node.clone())
                    .or_default()
                    .push(created.instance_id.clone());
                record.added_instances.push(created.instance_id);
            }

            let removals = usize::try_from(delta.removals()).unwrap_or(usize::MAX);
            if removals > 0 {
                let live = self
                    .retry("list_instances", || self.store.list_instances(&deployment_id, &node))
                    .await?;
                // Newest instances go first.
                let mut victims: Vec<InstanceId> =
                    live.into_iter().rev().take(removals).map(|i| i.id).collect();
                victims.sort();
                assignment.removed.insert(node.clone(), victims.clone());
                record.removed_instances.extend(victims);
            }
        }

        if self.coordinator.reinstall_on_modify() {
            let modified: BTreeSet<String> = record
                .steps
                .iter()
                .filter(|s| matches!(s.entity_type, EntityType::Property | EntityType::Operation))
                .filter_map(|s| s.owning_node().map(str::to_string))
                .collect();
            for node in modified {
                let live = self
                    .retry("list_instances", || self.store.list_instances(&deployment_id, &node))
                    .await?;
                let surviving: Vec<InstanceId> = live
                    .into_iter()
                    .map(|i| i.id)
                    .filter(|id| {
                        !record.removed_instances.contains(id) && !record.added_instances.contains(id)
                    })
                    .collect();
                if !surviving.is_empty() {
                    assignment.reinstalled.insert(node, surviving);
                }
            }
        }
        Ok(())
    }

    /// Delete removed instances, commit the topology and settle the record
    ///
    /// Safe to re-run on a record left in `FINALIZING`: deletions ignore
    /// instances that are already gone and the commit is skipped when the
    /// topology is already in place. A failed record write leaves the record
    /// in `FINALIZING` with its execution held.
    async fn finalize(&self, mut record: DeploymentUpdate) -> Result<DeploymentUpdate, EngineError> {
        if record.state == UpdateState::ExecutingWorkflow {
            self.transition(&mut record, UpdateState::Finalizing).await?;
        }

        let deletions = join_all(
            record
                .removed_instances
                .iter()
                .map(|id| self.store.delete_instance(id)),
        )
        .await;
        let failed_deletion = deletions
            .into_iter()
            .filter_map(Result::err)
            .find(|err| !err.is_not_found());

        let committed = match failed_deletion {
            Some(err) => Err(EngineError::from(err)),
            None => self.commit(&record).await,
        };

        match committed {
            Ok(deployment_version) => {
                record.phase = UpdatePhase::Final;
                self.transition(&mut record, UpdateState::Successful).await?;
                info!(
                    update_id = %record.id,
                    deployment_id = %record.deployment_id,
                    deployment_version,
                    "deployment update successful"
                );
            }
            Err(err) if err.is_retryable() && !matches!(err, EngineError::VersionConflict(_)) => {
                warn!(update_id = %record.id, error = %err, "finalization interrupted");
                return Err(err);
            }
            Err(err) => {
                error!(update_id = %record.id, error = %err, "finalization failed");
                record.error = Some(err.to_string());
                self.transition(&mut record, UpdateState::Failed).await?;
            }
        }
        self.release_execution(&record).await;
        Ok(record)
    }

    /// Commit the record's topology over the version it was planned against
    ///
    /// A version conflict where the deployment already holds exactly this
    /// topology one version later counts as committed.
    async fn commit(&self, record: &DeploymentUpdate) -> Result<u64, EngineError> {
        let expected = record.old_topology_ref.version;
        let err = match self
            .retry("commit_topology", || {
                self.store
                    .commit_topology(&record.deployment_id, &record.new_topology, expected)
            })
            .await
        {
            Ok(version) => return Ok(version),
            Err(err) => err,
        };
        if !err.is_version_conflict() {
            return Err(err.into());
        }

        let current = self
            .retry("get_topology", || self.store.get_topology(&record.deployment_id))
            .await?;
        if current.version == expected + 1 && current.topology.hash() == record.new_topology.hash() {
            debug!(update_id = %record.id, version = current.version, "topology already committed");
            Ok(current.version)
        } else {
            Err(err.into())
        }
    }

    /// Record a failed or cancelled workflow
    ///
    /// A failed record write keeps the update in `EXECUTING_WORKFLOW`, so the
    /// same event can be delivered again.
    async fn fail_execution(
        &self,
        mut record: DeploymentUpdate,
        reason: String,
    ) -> Result<DeploymentUpdate, EngineError> {
        warn!(update_id = %record.id, %reason, "update workflow did not complete");
        record.error = Some(reason);
        self.transition(&mut record, UpdateState::Failed).await?;
        self.release_execution(&record).await;
        Ok(record)
    }

    /// Fail an update whose workflow never started
    ///
    /// Placeholders are dropped only once the failure is recorded. The
    /// execution slot is released either way, which lets a forced submission
    /// replace a record that could not be failed.
    async fn abort(&self, mut record: DeploymentUpdate, err: EngineError) -> EngineError {
        if err.is_fault() {
            error!(update_id = %record.id, error = %err, "deployment update aborted before execution");
        } else {
            warn!(update_id = %record.id, error = %err, "deployment update aborted before execution");
        }
        record.error = Some(err.to_string());
        match self.transition(&mut record, UpdateState::Failed).await {
            Ok(()) => {
                for id in &record.added_instances {
                    if let Err(delete_err) = self.store.delete_instance(id).await {
                        if !delete_err.is_not_found() {
                            warn!(instance_id = %id, error = %delete_err, "placeholder cleanup failed");
                        }
                    }
                }
            }
            Err(persist_err) => {
                error!(update_id = %record.id, error = %persist_err, "could not record failure");
            }
        }
        self.release_execution(&record).await;
        err
    }

    async fn release_execution(&self, record: &DeploymentUpdate) {
        let Some(execution_id) = record.execution_id else {
            return;
        };
        let released = self
            .retry("end_execution", || {
                self.store.end_execution(&record.deployment_id, &execution_id)
            })
            .await;
        if let Err(err) = released {
            warn!(update_id = %record.id, %execution_id, error = %err, "could not release execution");
        }
    }

    /// Validate, persist and adopt a state change
    ///
    /// `record` is left untouched when validation or the write fails.
    async fn transition(&self, record: &mut DeploymentUpdate, to: UpdateState) -> Result<(), EngineError> {
        let mut next = record.clone();
        state_machine::transition(&mut next, to, Utc::now())?;
        let expected = record.version;
        let snapshot = &next;
        let version = self
            .retry("update_deployment_update", || {
                self.store.update_deployment_update(snapshot, expected)
            })
            .await?;
        next.version = version;
        info!(
            update_id = %next.id,
            deployment_id = %next.deployment_id,
            from = %record.state,
            to = %to,
            "deployment update transitioned"
        );
        *record = next;
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        with_storage_retry(&self.config.storage_retry, operation, call).await
    }
}
