//! Migration planning
//!
//! [`Planner::plan`] orders changes by [`Bucket`], then by entity id, then by
//! entity type, and derives the instance deltas implied by node changes.

use crate::bucket::{bucket_of, Bucket};
use crate::instances::{InstanceDelta, LiveState};
use crate::modified::ModifiedEntities;
use crate::step::Step;
use depup_topology::{
    Change, ChangeOperation, EntityId, EntityType, InstanceBounds, PathError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Ordered plan for one deployment update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Steps in execution order
    pub steps: Vec<Step>,
    /// Non-zero instance deltas, keyed by node id
    pub instance_deltas: BTreeMap<String, InstanceDelta>,
    /// Sealed audit of touched entities
    pub modified_entities: ModifiedEntities,
    /// Node versions read at planning time, for every existing node touched
    pub expected_versions: BTreeMap<String, u64>,
}

impl MigrationPlan {
    /// Nothing to do
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps belonging to `bucket`, in order
    pub fn steps_in(&self, bucket: Bucket) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(move |s| bucket_of(s.entity_type, s.operation) == bucket)
    }
}

/// Produces [`MigrationPlan`]s
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    include_payloads: bool,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            include_payloads: true,
        }
    }
}

impl Planner {
    /// Planner with payloads enabled
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach skeleton payloads to additions and modifications
    #[inline]
    #[must_use]
    pub fn with_payloads(mut self, include: bool) -> Self {
        self.include_payloads = include;
        self
    }

    /// Order `changes` into steps and compute instance deltas against `live`
    ///
    /// # Errors
    /// - [`PlanError::UnsupportedChanges`] if a node changes type or a
    ///   surviving node gains, loses or moves its container
    /// - [`PlanError::DuplicateChange`] if an entity appears twice
    /// - [`PlanError::InvalidInstances`] if instance bounds cannot be read
    pub fn plan(&self, changes: &[Change], live: &LiveState) -> Result<MigrationPlan, PlanError> {
        let unsupported: Vec<EntityId> = changes
            .iter()
            .filter_map(unsupported_entity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !unsupported.is_empty() {
            return Err(PlanError::UnsupportedChanges(unsupported));
        }

        let mut ordered: Vec<&Change> = changes.iter().collect();
        ordered.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut steps = Vec::with_capacity(ordered.len());
        let mut instance_deltas = BTreeMap::new();
        let mut expected_versions = BTreeMap::new();
        let mut modified_entities = ModifiedEntities::new();

        for (index, change) in ordered.into_iter().enumerate() {
            modified_entities.record(change.entity_type, change.entity_id.clone())?;

            if let Some(node) = change.owning_node() {
                if let Some(live_node) = live.get(node) {
                    expected_versions.insert(node.to_string(), live_node.version);
                }
            }
            if let Some(delta) = instance_delta(change, live)? {
                if !delta.is_noop() {
                    instance_deltas.insert(change.entity_id.as_str().to_string(), delta);
                }
            }

            steps.push(Step {
                sequence_index: u32::try_from(index).map_err(|_| PlanError::TooManySteps)?,
                entity_type: change.entity_type,
                operation: change.operation,
                entity_id: change.entity_id.clone(),
                payload: self.payload(change)?,
            });
        }
        modified_entities.seal();

        debug!(
            steps = steps.len(),
            instance_deltas = instance_deltas.len(),
            "planned deployment update"
        );

        Ok(MigrationPlan {
            steps,
            instance_deltas,
            modified_entities,
            expected_versions,
        })
    }

    fn payload(&self, change: &Change) -> Result<Option<Value>, PlanError> {
        match (&change.new_value, self.include_payloads) {
            (Some(value), true) => Ok(Some(change.path.skeleton(value.clone())?)),
            _ => Ok(None),
        }
    }
}

fn sort_key(change: &Change) -> (Bucket, &str, &'static str) {
    (
        bucket_of(change.entity_type, change.operation),
        change.entity_id.as_str(),
        change.entity_type.as_str(),
    )
}

/// Node that `change` would have to migrate in place, if it cannot be
///
/// Node type changes and containment changes of surviving nodes both
/// require reinstalling the node, which an update does not do.
fn unsupported_entity(change: &Change) -> Option<EntityId> {
    match change.entity_type {
        EntityType::Node if change.operation == ChangeOperation::Modify => {
            let type_of =
                |value: &Option<Value>| value.as_ref().and_then(|v| v.get("type")).cloned();
            (type_of(&change.old_value) != type_of(&change.new_value))
                .then(|| change.entity_id.clone())
        }
        EntityType::Relationship => {
            let contained = |value: &Option<Value>| value.as_ref().is_some_and(is_containment);
            if contained(&change.old_value) == contained(&change.new_value) {
                return None;
            }
            change.owning_node().map(EntityId::new)
        }
        _ => None,
    }
}

/// `contained_in` or a type derived from it, such as `cloudify.relationships.contained_in`
fn is_containment(relationship: &Value) -> bool {
    relationship
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind == "contained_in" || kind.ends_with(".contained_in"))
}

fn bounds_of(node: &str, value: Option<&Value>) -> Result<InstanceBounds, PlanError> {
    match value.and_then(|v| v.get("instances")) {
        None => Ok(InstanceBounds::default()),
        Some(raw) => {
            serde_json::from_value(raw.clone()).map_err(|e| PlanError::InvalidInstances {
                node: node.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

fn instance_delta(change: &Change, live: &LiveState) -> Result<Option<InstanceDelta>, PlanError> {
    if change.entity_type != EntityType::Node {
        return Ok(None);
    }
    let node = change.entity_id.as_str();
    let current = live.get(node).map_or(0, |n| n.live_instances);

    let delta = match change.operation {
        ChangeOperation::Add => {
            let bounds = bounds_of(node, change.new_value.as_ref())?;
            Some(InstanceDelta::new(current, bounds.target()))
        }
        ChangeOperation::Remove => Some(InstanceDelta::new(current, 0)),
        ChangeOperation::Modify => {
            let before = bounds_of(node, change.old_value.as_ref())?;
            let after = bounds_of(node, change.new_value.as_ref())?;
            (before != after).then(|| InstanceDelta::new(current, after.target()))
        }
    };
    Ok(delta)
}

/// Planning errors; all are input errors and never retried
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Changes that cannot be applied to a running deployment
    #[error("unsupported changes: {}", join_ids(.0))]
    UnsupportedChanges(Vec<EntityId>),

    /// Same entity changed twice
    #[error("entity {entity_type} '{entity_id}' changed more than once")]
    DuplicateChange {
        /// Entity type
        entity_type: EntityType,
        /// Entity id
        entity_id: EntityId,
    },

    /// Modified entities appended after planning finished
    #[error("modified entities are sealed")]
    Sealed,

    /// Unreadable instance bounds
    #[error("invalid instance bounds for node '{node}': {reason}")]
    InvalidInstances {
        /// Node id
        node: String,
        /// Parse failure
        reason: String,
    },

    /// Payload could not be materialized
    #[error("payload error: {0}")]
    Path(#[from] PathError),

    /// More steps than a sequence index can hold
    #[error("too many steps")]
    TooManySteps,
}

fn join_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(EntityId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::LiveNode;
    use depup_topology::{diff, Topology};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn topology(value: Value) -> Topology {
        Topology::from_value(value).unwrap()
    }

    fn plan(old: &Topology, new: &Topology, live: &LiveState) -> MigrationPlan {
        Planner::new().plan(&diff(old, new), live).unwrap()
    }

    fn summary(plan: &MigrationPlan) -> Vec<String> {
        plan.steps.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn plan_add_node_with_relationship() {
        let old = topology(json!({"nodes": {"n1": {"type": "t"}}}));
        let new = topology(json!({"nodes": {
            "n1": {"type": "t", "relationships": [{"type": "connected_to", "target_id": "n2"}]},
            "n2": {"type": "t"}
        }}));
        let live = LiveState::from([("n1".to_string(), LiveNode::new(4, 1))]);
        let plan = plan(&old, &new, &live);

        assert_eq!(summary(&plan), vec!["ADD node n2", "ADD relationship n1::n2"]);
        assert_eq!(plan.instance_deltas["n2"].delta(), 1);
        assert_eq!(plan.instance_deltas.len(), 1);
        assert_eq!(plan.expected_versions.get("n1"), Some(&4));
        assert_eq!(
            plan.steps[0].payload,
            Some(json!({"nodes": {"n2": {"type": "t"}}}))
        );
        let indexes: Vec<u32> = plan.steps.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn plan_remove_node_with_relationship() {
        let old = topology(json!({"nodes": {
            "n1": {"type": "t", "relationships": [{"type": "r", "target_id": "n2"}]},
            "n2": {"type": "t"}
        }}));
        let new = topology(json!({"nodes": {"n1": {"type": "t"}}}));
        let live = LiveState::from([
            ("n1".to_string(), LiveNode::new(1, 1)),
            ("n2".to_string(), LiveNode::new(2, 3)),
        ]);
        let plan = plan(&old, &new, &live);

        assert_eq!(summary(&plan), vec!["REMOVE relationship n1::n2", "REMOVE node n2"]);
        assert_eq!(plan.instance_deltas["n2"].delta(), -3);
        assert!(plan.steps.iter().all(|s| s.payload.is_none()));
    }

    #[test]
    fn plan_identical_topologies_is_empty() {
        let t = topology(json!({"nodes": {"n1": {"type": "t"}}}));
        let plan = plan(&t, &t, &LiveState::new());
        assert!(plan.is_empty());
        assert!(plan.modified_entities.is_empty());
        assert!(plan.modified_entities.is_sealed());
    }

    #[test]
    fn plan_property_change_stays_in_mutate_bucket_next_to_relationship_changes() {
        let old = topology(json!({"nodes": {
            "a": {"type": "t", "properties": {"port": 80},
                  "relationships": [{"type": "r", "target_id": "b"}]},
            "b": {"type": "t"},
            "c": {"type": "t"}
        }}));
        let new = topology(json!({"nodes": {
            "a": {"type": "t", "properties": {"port": 81},
                  "relationships": [{"type": "r", "target_id": "c"}]},
            "b": {"type": "t"},
            "c": {"type": "t"}
        }}));
        let plan = plan(&old, &new, &LiveState::new());
        assert_eq!(
            summary(&plan),
            vec![
                "REMOVE relationship a::b",
                "MODIFY property a.properties.port",
                "ADD relationship a::c",
            ]
        );
        assert_eq!(plan.steps_in(Bucket::Mutate).count(), 1);
    }

    #[test]
    fn plan_mutate_bucket_sorted_by_entity_id() {
        let old = topology(json!({
            "nodes": {"web": {"type": "t", "properties": {"z": 1}}},
            "outputs": {"b": 1},
            "workflows": {"a": {}}
        }));
        let new = topology(json!({
            "nodes": {"web": {"type": "t", "properties": {"z": 2}}},
            "outputs": {"b": 2},
            "workflows": {"a": {"mapping": "x"}},
            "groups": {"c": {}}
        }));
        let plan = plan(&old, &new, &LiveState::new());
        assert_eq!(
            summary(&plan),
            vec![
                "MODIFY workflow a",
                "MODIFY output b",
                "ADD group c",
                "MODIFY property web.properties.z",
            ]
        );
    }

    #[test]
    fn plan_scale_policy_change() {
        let old = topology(json!({"nodes": {"a": {"type": "t", "instances": {"default": 1}}}}));
        let new = topology(json!({"nodes": {"a": {"type": "t", "instances": {"default": 3, "max": 5}}}}));
        let live = LiveState::from([("a".to_string(), LiveNode::new(7, 1))]);
        let plan = plan(&old, &new, &live);
        assert_eq!(summary(&plan), vec!["MODIFY node a"]);
        assert_eq!(plan.instance_deltas["a"], InstanceDelta::new(1, 3));
        assert_eq!(plan.expected_versions.get("a"), Some(&7));
    }

    #[test]
    fn plan_scale_policy_change_to_current_count_is_noop() {
        let old = topology(json!({"nodes": {"a": {"type": "t", "instances": {"default": 1}}}}));
        let new = topology(json!({"nodes": {"a": {"type": "t", "instances": {"default": 2, "max": 5}}}}));
        let live = LiveState::from([("a".to_string(), LiveNode::new(7, 2))]);
        let plan = plan(&old, &new, &live);
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.instance_deltas.is_empty());
    }

    #[test]
    fn plan_rejects_node_type_change() {
        let old = topology(json!({"nodes": {"a": {"type": "web"}}}));
        let new = topology(json!({"nodes": {"a": {"type": "db"}}}));
        let result = Planner::new().plan(&diff(&old, &new), &LiveState::new());
        assert!(matches!(result, Err(PlanError::UnsupportedChanges(ids)) if ids == vec![EntityId::new("a")]));
    }

    #[test]
    fn plan_rejects_containment_changes_of_surviving_nodes() {
        let old = topology(json!({"nodes": {
            "vm1": {"type": "vm"},
            "vm2": {"type": "vm"},
            "app": {"type": "app", "relationships": [{"type": "contained_in", "target_id": "vm1"}]},
        }}));
        let moved = topology(json!({"nodes": {
            "vm1": {"type": "vm"},
            "vm2": {"type": "vm"},
            "app": {"type": "app", "relationships": [{"type": "contained_in", "target_id": "vm2"}]},
        }}));
        let result = Planner::new().plan(&diff(&old, &moved), &LiveState::new());
        assert!(matches!(result, Err(PlanError::UnsupportedChanges(ids)) if ids == vec![EntityId::new("app")]));

        let loose = topology(json!({"nodes": {
            "vm1": {"type": "vm"},
            "vm2": {"type": "vm"},
            "app": {"type": "app", "relationships": [{"type": "connected_to", "target_id": "vm1"}]},
        }}));
        let result = Planner::new().plan(&diff(&old, &loose), &LiveState::new());
        assert!(matches!(result, Err(PlanError::UnsupportedChanges(ids)) if ids == vec![EntityId::new("app")]));
    }

    #[test]
    fn plan_allows_connections_and_new_contained_nodes() {
        let old = topology(json!({"nodes": {
            "vm": {"type": "vm"},
            "app": {"type": "app", "relationships": [{"type": "contained_in", "target_id": "vm"}]},
        }}));
        let new = topology(json!({"nodes": {
            "vm": {"type": "vm"},
            "db": {"type": "db", "relationships": [
                {"type": "cloudify.relationships.contained_in", "target_id": "vm"},
            ]},
            "app": {"type": "app", "relationships": [
                {"type": "contained_in", "target_id": "vm"},
                {"type": "connected_to", "target_id": "db"},
            ]},
        }}));
        let live = LiveState::from([
            ("vm".to_string(), LiveNode::new(1, 1)),
            ("app".to_string(), LiveNode::new(1, 1)),
        ]);
        let plan = plan(&old, &new, &live);
        assert_eq!(summary(&plan), vec!["ADD node db", "ADD relationship app::db"]);
    }

    #[test]
    fn plan_rejects_duplicate_changes() {
        let change = Change::remove(
            EntityType::Output,
            EntityId::new("o"),
            "outputs.o".parse().unwrap(),
            json!(1),
        );
        let result = Planner::new().plan(&[change.clone(), change], &LiveState::new());
        assert!(matches!(result, Err(PlanError::DuplicateChange { .. })));
    }

    #[test]
    fn plan_without_payloads() {
        let old = topology(json!({"nodes": {}}));
        let new = topology(json!({"nodes": {"a": {"type": "t"}}}));
        let plan = Planner::new()
            .with_payloads(false)
            .plan(&diff(&old, &new), &LiveState::new())
            .unwrap();
        assert_eq!(plan.steps[0].payload, None);
    }
}
