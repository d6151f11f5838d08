//! Audit of entities touched by a migration plan

use crate::planner::PlanError;
use depup_topology::{EntityId, EntityType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entities touched by a plan, grouped by entity type
///
/// Append-only while planning; [`Planner`](crate::Planner) seals it before
/// handing the plan out. Serialized with one key per entity type, where the
/// `relationship` entry maps each source node to its target nodes.
/// Relationship ids are kept grouped by source node, sources in ascending
/// order, so a record reads back exactly as it was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ModifiedEntitiesWire", into = "ModifiedEntitiesWire")]
pub struct ModifiedEntities {
    entries: BTreeMap<EntityType, Vec<EntityId>>,
    sealed: bool,
}

impl ModifiedEntities {
    /// Create an empty, unsealed record
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entity id
    ///
    /// # Errors
    /// Returns [`PlanError::Sealed`] after [`Self::seal`], and
    /// [`PlanError::DuplicateChange`] if the id was already recorded
    pub fn record(&mut self, entity_type: EntityType, entity_id: EntityId) -> Result<(), PlanError> {
        if self.sealed {
            return Err(PlanError::Sealed);
        }
        let ids = self.entries.entry(entity_type).or_default();
        if ids.contains(&entity_id) {
            return Err(PlanError::DuplicateChange {
                entity_type,
                entity_id,
            });
        }
        if entity_type == EntityType::Relationship {
            let source = source_of(&entity_id);
            let at = ids.partition_point(|id| source_of(id) <= source);
            ids.insert(at, entity_id);
        } else {
            ids.push(entity_id);
        }
        Ok(())
    }

    /// Make the record read-only
    #[inline]
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether the record is read-only
    #[inline]
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Ids recorded for `entity_type`, in recording order
    ///
    /// Relationships are ordered by source node first.
    #[must_use]
    pub fn get(&self, entity_type: EntityType) -> &[EntityId] {
        self.entries
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether `entity_id` was recorded under `entity_type`
    #[must_use]
    pub fn contains(&self, entity_type: EntityType, entity_id: &EntityId) -> bool {
        self.get(entity_type).contains(entity_id)
    }

    /// Total number of recorded ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Nothing recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relationship ids grouped as `source -> [targets]`
    #[must_use]
    pub fn relationships_by_source(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in self.get(EntityType::Relationship) {
            if let Some((source, target)) = id.relationship_endpoints() {
                grouped
                    .entry(source.to_string())
                    .or_default()
                    .push(target.to_string());
            }
        }
        grouped
    }
}

fn source_of(id: &EntityId) -> &str {
    id.relationship_endpoints()
        .map_or(id.as_str(), |(source, _)| source)
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct ModifiedEntitiesWire {
    node: Vec<EntityId>,
    relationship: BTreeMap<String, Vec<String>>,
    property: Vec<EntityId>,
    output: Vec<EntityId>,
    workflow: Vec<EntityId>,
    group: Vec<EntityId>,
    policy: Vec<EntityId>,
    operation: Vec<EntityId>,
}

impl From<ModifiedEntities> for ModifiedEntitiesWire {
    fn from(modified: ModifiedEntities) -> Self {
        let mut wire = Self {
            relationship: modified.relationships_by_source(),
            ..Self::default()
        };
        for (entity_type, ids) in modified.entries {
            let slot = match entity_type {
                EntityType::Relationship => continue,
                EntityType::Node => &mut wire.node,
                EntityType::Property => &mut wire.property,
                EntityType::Output => &mut wire.output,
                EntityType::Workflow => &mut wire.workflow,
                EntityType::Group => &mut wire.group,
                EntityType::Policy => &mut wire.policy,
                EntityType::Operation => &mut wire.operation,
            };
            *slot = ids;
        }
        wire
    }
}

/// Persisted records are read back sealed
impl From<ModifiedEntitiesWire> for ModifiedEntities {
    fn from(wire: ModifiedEntitiesWire) -> Self {
        let relationships: Vec<EntityId> = wire
            .relationship
            .into_iter()
            .flat_map(|(source, targets)| {
                targets
                    .into_iter()
                    .map(move |target| EntityId::relationship(&source, &target))
            })
            .collect();

        let entries = [
            (EntityType::Node, wire.node),
            (EntityType::Relationship, relationships),
            (EntityType::Property, wire.property),
            (EntityType::Output, wire.output),
            (EntityType::Workflow, wire.workflow),
            (EntityType::Group, wire.group),
            (EntityType::Policy, wire.policy),
            (EntityType::Operation, wire.operation),
        ]
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .collect();

        Self {
            entries,
            sealed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_is_append_only() {
        let mut modified = ModifiedEntities::new();
        modified.record(EntityType::Node, EntityId::new("b")).unwrap();
        modified.record(EntityType::Node, EntityId::new("a")).unwrap();
        assert_eq!(modified.get(EntityType::Node), &[EntityId::new("b"), EntityId::new("a")]);

        let duplicate = modified.record(EntityType::Node, EntityId::new("a"));
        assert!(matches!(duplicate, Err(PlanError::DuplicateChange { .. })));

        modified.seal();
        let late = modified.record(EntityType::Output, EntityId::new("o"));
        assert!(matches!(late, Err(PlanError::Sealed)));
        assert_eq!(modified.len(), 2);
    }

    #[test]
    fn relationships_serialize_grouped_by_source() {
        let mut modified = ModifiedEntities::new();
        modified
            .record(EntityType::Relationship, EntityId::relationship("web", "db"))
            .unwrap();
        modified
            .record(EntityType::Relationship, EntityId::relationship("web", "cache"))
            .unwrap();
        modified
            .record(EntityType::Relationship, EntityId::relationship("worker", "db"))
            .unwrap();
        modified
            .record(EntityType::Property, EntityId::scoped("web", "properties", "port"))
            .unwrap();

        let encoded = serde_json::to_value(&modified).unwrap();
        assert_eq!(encoded["relationship"], json!({"web": ["db", "cache"], "worker": ["db"]}));
        assert_eq!(encoded["property"], json!(["web.properties.port"]));
        assert_eq!(encoded["node"], json!([]));
    }

    #[test]
    fn interleaved_relationships_read_back_unchanged() {
        let mut modified = ModifiedEntities::new();
        for (source, target) in [("worker", "db"), ("web", "db"), ("worker", "queue"), ("web", "cache")] {
            modified
                .record(EntityType::Relationship, EntityId::relationship(source, target))
                .unwrap();
        }
        modified.seal();
        assert_eq!(
            modified.get(EntityType::Relationship),
            &[
                EntityId::relationship("web", "db"),
                EntityId::relationship("web", "cache"),
                EntityId::relationship("worker", "db"),
                EntityId::relationship("worker", "queue"),
            ]
        );

        let decoded: ModifiedEntities =
            serde_json::from_str(&serde_json::to_string(&modified).unwrap()).unwrap();
        assert_eq!(decoded, modified);
    }

    #[test]
    fn deserialized_record_is_sealed() {
        let decoded: ModifiedEntities = serde_json::from_value(json!({
            "node": ["n2"],
            "relationship": {"n1": ["n2"]}
        }))
        .unwrap();
        assert!(decoded.is_sealed());
        assert!(decoded.contains(EntityType::Relationship, &EntityId::relationship("n1", "n2")));
        assert!(decoded.contains(EntityType::Node, &EntityId::new("n2")));
        assert!(decoded.get(EntityType::Policy).is_empty());
    }
}
