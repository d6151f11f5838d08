//! Identifiers and persisted records of the update lifecycle

use crate::executor::ExecutionToken;
use chrono::{DateTime, Utc};
use depup_planner::{InstanceDelta, MigrationPlan, ModifiedEntities, Step};
use depup_topology::{ContentHash, Topology};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use ulid::Ulid;
use uuid::Uuid;

/// Deployment identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeploymentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeploymentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Deployment update identifier, `{deployment}-{ulid}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentUpdateId(String);

impl DeploymentUpdateId {
    /// Fresh id scoped to `deployment`
    #[must_use]
    pub fn generate(deployment: &DeploymentId) -> Self {
        Self(format!("{deployment}-{}", Ulid::new()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeploymentUpdateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeploymentUpdateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Workflow execution identifier, assigned by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node instance identifier, `{node}_{sequence}`
///
/// Ordered by node, then numerically by sequence, so the newest instance of a
/// node always sorts last regardless of how many digits its sequence has.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new(node_id: &str, sequence: u64) -> Self {
        Self(format!("{node_id}_{sequence:06}"))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Node id and numeric sequence, when the id carries one
    fn sort_key(&self) -> (&str, Option<u64>) {
        match self.0.rsplit_once('_') {
            Some((node, sequence)) => match sequence.parse() {
                Ok(sequence) => (node, Some(sequence)),
                Err(_) => (&self.0, None),
            },
            None => (&self.0, None),
        }
    }
}

impl Ord for InstanceId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for InstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a deployment update
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    /// Admitted, preparing instances and submitting the workflow
    Updating,
    /// Workflow submitted and running
    ExecutingWorkflow,
    /// Workflow succeeded, committing the new topology
    Finalizing,
    Successful,
    Failed,
    /// Submitted topology equals the current one
    NoChangesRequired,
}

impl UpdateState {
    /// All states, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::Updating,
        Self::ExecutingWorkflow,
        Self::Finalizing,
        Self::Successful,
        Self::Failed,
        Self::NoChangesRequired,
    ];

    /// Terminal records are immutable
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::NoChangesRequired)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Updating => "UPDATING",
            Self::ExecutingWorkflow => "EXECUTING_WORKFLOW",
            Self::Finalizing => "FINALIZING",
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
            Self::NoChangesRequired => "NO_CHANGES_REQUIRED",
        }
    }
}

impl Display for UpdateState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the new topology has been committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    Initial,
    Final,
}

/// One entry of a record's state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// `None` for the creation entry
    pub from: Option<UpdateState>,
    pub to: UpdateState,
    pub at: DateTime<Utc>,
}

/// Pointer to the topology an update was planned against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRef {
    pub deployment_id: DeploymentId,
    /// Deployment version observed at planning time
    pub version: u64,
    pub hash: ContentHash,
}

/// Current topology of a deployment with its version
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedTopology {
    pub topology: Topology,
    pub version: u64,
}

/// Persisted state of one deployment update
///
/// Created by admission and mutated only through
/// [`state_machine::transition`](crate::state_machine::transition) plus the
/// bookkeeping fields the engine fills in while in `UPDATING`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    pub id: DeploymentUpdateId,
    pub deployment_id: DeploymentId,
    pub created_at: DateTime<Utc>,
    pub phase: UpdatePhase,
    pub state: UpdateState,
    pub steps: Vec<Step>,
    pub modified_entities: ModifiedEntities,
    pub instance_deltas: BTreeMap<String, InstanceDelta>,
    /// Node versions the plan was computed against
    pub expected_versions: BTreeMap<String, u64>,
    pub execution_id: Option<ExecutionId>,
    pub execution_token: Option<ExecutionToken>,
    pub old_topology_ref: TopologyRef,
    pub new_topology: Topology,
    /// Instances pre-created for positive deltas
    #[serde(default)]
    pub added_instances: Vec<InstanceId>,
    /// Instances to delete during finalization
    #[serde(default)]
    pub removed_instances: Vec<InstanceId>,
    pub transitions: Vec<StateTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Storage version, bumped on every write
    pub version: u64,
}

impl DeploymentUpdate {
    /// New record for `plan`; empty plans start in `NO_CHANGES_REQUIRED`
    #[must_use]
    pub fn new(
        deployment_id: DeploymentId,
        old_topology_ref: TopologyRef,
        new_topology: Topology,
        plan: MigrationPlan,
        now: DateTime<Utc>,
    ) -> Self {
        let state = if plan.is_empty() {
            UpdateState::NoChangesRequired
        } else {
            UpdateState::Updating
        };
        Self {
            id: DeploymentUpdateId::generate(&deployment_id),
            deployment_id,
            created_at: now,
            phase: UpdatePhase::Initial,
            state,
            steps: plan.steps,
            modified_entities: plan.modified_entities,
            instance_deltas: plan.instance_deltas,
            expected_versions: plan.expected_versions,
            execution_id: None,
            execution_token: None,
            old_topology_ref,
            new_topology,
            added_instances: Vec::new(),
            removed_instances: Vec::new(),
            transitions: vec![StateTransition {
                from: None,
                to: state,
                at: now,
            }],
            error: None,
            version: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Lifecycle state of a node instance row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Placeholder created ahead of installation
    Uninitialized,
    Started,
}

/// Node instance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: InstanceId,
    pub deployment_id: DeploymentId,
    pub node_id: String,
    pub state: InstanceState,
    pub runtime_properties: Map<String, Value>,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use depup_planner::{LiveState, Planner};
    use depup_topology::diff;
    use serde_json::json;

    #[test]
    fn instance_ids_order_by_node_then_sequence() {
        assert!(InstanceId::new("web", 1_000_000) > InstanceId::new("web", 999_999));
        assert!(InstanceId::new("web", 2) > InstanceId::new("web", 1));
        assert!(InstanceId::new("api", 5) < InstanceId::new("web", 1));

        let mut ids = vec![
            InstanceId::new("web", 1_000_001),
            InstanceId::new("web_tier", 3),
            InstanceId::new("web", 999_999),
            InstanceId::new("web", 7),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(InstanceId::as_str).collect::<Vec<_>>(),
            vec!["web_000007", "web_999999", "web_1000001", "web_tier_000003"]
        );
    }

    fn topology(value: Value) -> Topology {
        Topology::from_value(value).unwrap()
    }

    fn record_for(old: &Topology, new: &Topology) -> DeploymentUpdate {
        let plan = Planner::new().plan(&diff(old, new), &LiveState::new()).unwrap();
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

    #[test]
    fn update_id_is_scoped_to_deployment() {
        let id = DeploymentUpdateId::generate(&DeploymentId::new("shop"));
        assert!(id.as_str().starts_with("shop-"));
        assert_ne!(id, DeploymentUpdateId::generate(&DeploymentId::new("shop")));
    }

    #[test]
    fn instance_id_format() {
        assert_eq!(InstanceId::new("web", 7).as_str(), "web_000007");
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = UpdateState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![UpdateState::Successful, UpdateState::Failed, UpdateState::NoChangesRequired]
        );
    }

    #[test]
    fn state_serializes_screaming() {
        assert_eq!(
            serde_json::to_value(UpdateState::ExecutingWorkflow).unwrap(),
            json!("EXECUTING_WORKFLOW")
        );
        assert_eq!(UpdateState::NoChangesRequired.to_string(), "NO_CHANGES_REQUIRED");
    }

    #[test]
    fn empty_plan_starts_without_changes() {
        let t = topology(json!({"nodes": {"n1": {"type": "server"}}}));
        let record = record_for(&t, &t);
        assert_eq!(record.state, UpdateState::NoChangesRequired);
        assert!(record.steps.is_empty());
        assert_eq!(record.transitions.len(), 1);
        assert_eq!(record.transitions[0].from, None);
    }

    #[test]
    fn non_empty_plan_starts_updating() {
        let old = topology(json!({"nodes": {"n1": {"type": "server"}}}));
        let new = topology(json!({"nodes": {"n1": {"type": "server"}, "n2": {"type": "db"}}}));
        let record = record_for(&old, &new);
        assert_eq!(record.state, UpdateState::Updating);
        assert_eq!(record.phase, UpdatePhase::Initial);
        assert_eq!(record.steps.len(), 1);
    }

    #[test]
    fn record_survives_serde() {
        let old = topology(json!({"nodes": {"n1": {"type": "server"}}}));
        let new = topology(json!({"nodes": {"n1": {"type": "server", "properties": {"port": 80}}}}));
        let record = record_for(&old, &new);
        let json = serde_json::to_string(&record).unwrap();
        let back: DeploymentUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
