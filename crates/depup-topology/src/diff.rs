//! Structural diff between two topologies
//!
//! [`diff`] walks both trees in sorted key order, so the result never depends
//! on map iteration order. Sub-trees are compared by [`ContentHash`].
//!
//! [`apply`] replays changes onto a base topology. For any `a`, `b`:
//! `diff(&apply(&a, &diff(&a, &b))?, &b)` is empty.

use crate::change::{Change, ChangeOperation, EntityId, EntityType};
use crate::hash::ContentHash;
use crate::path::{Breadcrumbs, PathError};
use crate::topology::{
    NodeSpec, Topology, TopologyError, KEYED_SECTIONS, NODES, OPERATIONS, PROPERTIES,
    RELATIONSHIPS,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Node keys diffed as their own entities rather than as part of the node
const NODE_SUB_ENTITIES: [&str; 3] = [PROPERTIES, OPERATIONS, RELATIONSHIPS];

/// Compute the changes turning `old` into `new`
///
/// Output is grouped by node (node change first, then its properties,
/// operations and relationships), followed by outputs, workflows, groups
/// and policies.
#[must_use]
pub fn diff(old: &Topology, new: &Topology) -> Vec<Change> {
    let mut changes = Vec::new();

    let ids: BTreeSet<&str> = old
        .nodes()
        .keys()
        .chain(new.nodes().keys())
        .map(String::as_str)
        .collect();
    for id in ids {
        let path = Breadcrumbs::from_keys([NODES, id]);
        match (old.node_value(id), new.node_value(id)) {
            (None, Some(added)) => changes.push(Change::add(
                EntityType::Node,
                EntityId::new(id),
                path,
                added.clone(),
            )),
            (Some(removed), None) => changes.push(Change::remove(
                EntityType::Node,
                EntityId::new(id),
                path,
                removed.clone(),
            )),
            (Some(before), Some(after)) => {
                if !same(&shell(before), &shell(after)) {
                    changes.push(Change::modify(
                        EntityType::Node,
                        EntityId::new(id),
                        path.clone(),
                        before.clone(),
                        after.clone(),
                    ));
                }
                for (entity_type, scope) in [
                    (EntityType::Property, PROPERTIES),
                    (EntityType::Operation, OPERATIONS),
                ] {
                    diff_keyed(
                        entity_type,
                        before.get(scope).and_then(Value::as_object),
                        after.get(scope).and_then(Value::as_object),
                        |key| EntityId::scoped(id, scope, key),
                        |key| path.child(scope).child(key),
                        &mut changes,
                    );
                }
                if let (Some(before), Some(after)) = (old.node(id), new.node(id)) {
                    diff_relationships(before, after, old, new, &mut changes);
                }
            }
            (None, None) => {}
        }
    }

    for (section, entity_type) in KEYED_SECTIONS.into_iter().zip([
        EntityType::Output,
        EntityType::Workflow,
        EntityType::Group,
        EntityType::Policy,
    ]) {
        diff_keyed(
            entity_type,
            old.section(section),
            new.section(section),
            |key| EntityId::new(key),
            |key| Breadcrumbs::from_keys([section, key]),
            &mut changes,
        );
    }

    changes
}

fn same(a: &Value, b: &Value) -> bool {
    ContentHash::of_value(a) == ContentHash::of_value(b)
}

/// Node definition without the parts diffed as separate entities
fn shell(node: &Value) -> Value {
    match node {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !NODE_SUB_ENTITIES.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn diff_keyed(
    entity_type: EntityType,
    old: Option<&Map<String, Value>>,
    new: Option<&Map<String, Value>>,
    id_of: impl Fn(&str) -> EntityId,
    path_of: impl Fn(&str) -> Breadcrumbs,
    changes: &mut Vec<Change>,
) {
    let empty = Map::new();
    let old = old.unwrap_or(&empty);
    let new = new.unwrap_or(&empty);
    let keys: BTreeSet<&str> = old.keys().chain(new.keys()).map(String::as_str).collect();

    for key in keys {
        match (old.get(key), new.get(key)) {
            (None, Some(added)) => {
                changes.push(Change::add(entity_type, id_of(key), path_of(key), added.clone()));
            }
            (Some(removed), None) => {
                changes.push(Change::remove(entity_type, id_of(key), path_of(key), removed.clone()));
            }
            (Some(before), Some(after)) if !same(before, after) => {
                changes.push(Change::modify(
                    entity_type,
                    id_of(key),
                    path_of(key),
                    before.clone(),
                    after.clone(),
                ));
            }
            _ => {}
        }
    }
}

/// Relationships are keyed by target, independent of declaration order
fn diff_relationships(
    before: &NodeSpec,
    after: &NodeSpec,
    old: &Topology,
    new: &Topology,
    changes: &mut Vec<Change>,
) {
    let source = before.id.as_str();
    let locate = |topology: &Topology, index: usize| -> (Breadcrumbs, Value) {
        let path = Breadcrumbs::from_keys([NODES, source]).child_indexed(RELATIONSHIPS, index);
        let value = path.traverse(topology.raw()).cloned().unwrap_or(Value::Null);
        (path, value)
    };

    let old_by_target: BTreeMap<&str, usize> = before
        .relationships
        .iter()
        .map(|r| (r.target_id.as_str(), r.index))
        .collect();
    let new_by_target: BTreeMap<&str, usize> = after
        .relationships
        .iter()
        .map(|r| (r.target_id.as_str(), r.index))
        .collect();
    let targets: BTreeSet<&str> = old_by_target
        .keys()
        .chain(new_by_target.keys())
        .copied()
        .collect();

    for target in targets {
        let id = EntityId::relationship(source, target);
        match (old_by_target.get(target), new_by_target.get(target)) {
            (None, Some(&index)) => {
                let (path, value) = locate(new, index);
                changes.push(Change::add(EntityType::Relationship, id, path, value));
            }
            (Some(&index), None) => {
                let (path, value) = locate(old, index);
                changes.push(Change::remove(EntityType::Relationship, id, path, value));
            }
            (Some(&old_index), Some(&new_index)) => {
                let (_, before_value) = locate(old, old_index);
                let (path, after_value) = locate(new, new_index);
                if !same(&before_value, &after_value) {
                    changes.push(Change::modify(
                        EntityType::Relationship,
                        id,
                        path,
                        before_value,
                        after_value,
                    ));
                }
            }
            (None, None) => {}
        }
    }
}

/// Replay `changes` onto `base`
///
/// Additions and modifications upsert, removals delete if present, so
/// overlapping changes (a node replaced along with its properties) agree.
///
/// # Errors
/// Returns [`ApplyError`] if a change cannot be located or the result is
/// not a valid topology
pub fn apply(base: &Topology, changes: &[Change]) -> Result<Topology, ApplyError> {
    let mut raw = base.raw().clone();
    for change in changes {
        match change.entity_type {
            EntityType::Relationship => apply_relationship(&mut raw, change)?,
            EntityType::Node
            | EntityType::Property
            | EntityType::Output
            | EntityType::Workflow
            | EntityType::Group
            | EntityType::Policy
            | EntityType::Operation => match change.operation {
                ChangeOperation::Add | ChangeOperation::Modify => {
                    change.path.insert(&mut raw, new_value(change)?)?;
                }
                ChangeOperation::Remove => {
                    change.path.remove(&mut raw);
                }
            },
        }
    }
    Ok(Topology::from_value(raw)?)
}

fn new_value(change: &Change) -> Result<Value, ApplyError> {
    change
        .new_value
        .clone()
        .ok_or_else(|| ApplyError::MissingValue(change.entity_id.clone()))
}

fn apply_relationship(raw: &mut Value, change: &Change) -> Result<(), ApplyError> {
    let (source, target) = change
        .entity_id
        .relationship_endpoints()
        .ok_or_else(|| ApplyError::MalformedRelationshipId(change.entity_id.clone()))?;
    let list_path = Breadcrumbs::from_keys([NODES, source, RELATIONSHIPS]);

    if list_path.traverse(raw).is_none() {
        if change.operation == ChangeOperation::Remove {
            return Ok(());
        }
        if Breadcrumbs::from_keys([NODES, source]).traverse(raw).is_none() {
            return Err(ApplyError::MissingSource(source.to_string()));
        }
        list_path.insert(raw, Value::Array(Vec::new()))?;
    }
    let Some(Value::Array(items)) = list_path.traverse_mut(raw) else {
        return Err(ApplyError::MissingSource(source.to_string()));
    };

    let position = items
        .iter()
        .position(|item| item.get("target_id").and_then(Value::as_str) == Some(target));
    match (change.operation, position) {
        (ChangeOperation::Remove, Some(index)) => {
            items.remove(index);
        }
        (ChangeOperation::Remove, None) => {}
        (ChangeOperation::Add | ChangeOperation::Modify, Some(index)) => {
            items[index] = new_value(change)?;
        }
        (ChangeOperation::Add | ChangeOperation::Modify, None) => {
            items.push(new_value(change)?);
        }
    }
    Ok(())
}

/// Errors replaying changes onto a topology
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("change for '{0}' carries no new value")]
    MissingValue(EntityId),

    #[error("'{0}' is not a relationship id")]
    MalformedRelationshipId(EntityId),

    #[error("relationship source node '{0}' not found")]
    MissingSource(String),

    #[error("path error: {0}")]
    Path(#[from] PathError),

    #[error("result is not a valid topology: {0}")]
    Topology(#[from] TopologyError),
}
