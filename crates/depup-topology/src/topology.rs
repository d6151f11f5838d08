//! Validated deployment topology
//!
//! A [`Topology`] keeps the raw tree (so changes can be located with
//! [`Breadcrumbs`](crate::Breadcrumbs)) next to a typed index of its nodes.
//!
//! ```yaml
//! nodes:
//!   web:
//!     type: webserver
//!     properties: { port: 80 }
//!     instances: { min: 1, max: 3, default: 2 }
//!     relationships:
//!       - { type: connected_to, target_id: db }
//!   db:
//!     type: database
//! outputs:
//!   endpoint: { value: "http://web" }
//! ```

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Joins source and target node ids into a relationship id (`web::db`)
pub const RELATIONSHIP_SEPARATOR: &str = "::";

pub(crate) const NODES: &str = "nodes";
pub(crate) const PROPERTIES: &str = "properties";
pub(crate) const OPERATIONS: &str = "operations";
pub(crate) const RELATIONSHIPS: &str = "relationships";

/// Top-level sections keyed by entity id, besides `nodes`
pub(crate) const KEYED_SECTIONS: [&str; 4] = ["outputs", "workflows", "groups", "policies"];

/// Instance-count policy of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBounds {
    #[serde(default)]
    pub min: u32,
    /// `None` means unbounded
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default = "default_instances")]
    pub default: u32,
}

fn default_instances() -> u32 {
    1
}

impl Default for InstanceBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: None,
            default: default_instances(),
        }
    }
}

impl InstanceBounds {
    #[inline]
    #[must_use]
    pub fn new(min: u32, max: Option<u32>, default: u32) -> Self {
        Self { min, max, default }
    }

    /// Clamp `count` into `[min, max]`
    #[inline]
    #[must_use]
    pub fn clamp(&self, count: u32) -> u32 {
        let floor = count.max(self.min);
        self.max.map_or(floor, |max| floor.min(max))
    }

    /// Instance count this policy asks for: `clamp(default)`
    #[inline]
    #[must_use]
    pub fn target(&self) -> u32 {
        self.clamp(self.default)
    }

    fn is_consistent(&self) -> bool {
        self.min <= self.default && self.max.map_or(true, |max| self.default <= max)
    }
}

/// Typed view of one relationship declared by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipSpec {
    pub rel_type: String,
    pub target_id: String,
    /// Position in the source node's `relationships` sequence
    pub index: usize,
}

/// Typed view of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    pub node_type: String,
    pub instances: InstanceBounds,
    pub properties: Map<String, Value>,
    pub operations: Map<String, Value>,
    pub relationships: Vec<RelationshipSpec>,
}

impl NodeSpec {
    /// Relationship from this node to `target`, if declared
    #[must_use]
    pub fn relationship_to(&self, target: &str) -> Option<&RelationshipSpec> {
        self.relationships.iter().find(|r| r.target_id == target)
    }
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    operations: Map<String, Value>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
    #[serde(default)]
    instances: InstanceBounds,
}

#[derive(Deserialize)]
struct RawRelationship {
    #[serde(rename = "type")]
    rel_type: String,
    target_id: String,
}

/// A validated deployment topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Topology {
    raw: Value,
    nodes: BTreeMap<String, NodeSpec>,
    hash: ContentHash,
}

impl Topology {
    /// Topology with no nodes
    #[must_use]
    pub fn empty() -> Self {
        let mut raw = Map::new();
        raw.insert(NODES.to_string(), Value::Object(Map::new()));
        let raw = Value::Object(raw);
        let hash = ContentHash::of_value(&raw);
        Self {
            raw,
            nodes: BTreeMap::new(),
            hash,
        }
    }

    /// Validate and index a raw topology tree
    ///
    /// A `nodes` sequence of `{id, ...}` entries is normalized into a mapping.
    ///
    /// # Errors
    /// Returns [`TopologyError`] if the tree is malformed
    pub fn from_value(raw: Value) -> Result<Self, TopologyError> {
        let Value::Object(mut root) = raw else {
            return Err(TopologyError::NotAMapping {
                section: "<root>".to_string(),
            });
        };

        let nodes_value = root
            .remove(NODES)
            .unwrap_or_else(|| Value::Object(Map::new()));
        root.insert(NODES.to_string(), Value::Object(normalize_nodes(nodes_value)?));

        for section in KEYED_SECTIONS {
            match root.get(section) {
                None | Some(Value::Null) => {}
                Some(Value::Object(entries)) => {
                    for id in entries.keys() {
                        validate_identifier(section, id)?;
                    }
                }
                Some(_) => {
                    return Err(TopologyError::NotAMapping {
                        section: section.to_string(),
                    })
                }
            }
        }

        let mut nodes = BTreeMap::new();
        if let Some(Value::Object(entries)) = root.get(NODES) {
            for (id, value) in entries {
                nodes.insert(id.clone(), parse_node(id, value)?);
            }
        }
        validate_relationships(&nodes)?;

        let raw = Value::Object(root);
        let hash = ContentHash::of_value(&raw);
        Ok(Self { raw, nodes, hash })
    }

    /// # Errors
    /// Returns [`TopologyError`] on invalid JSON or an invalid tree
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// # Errors
    /// Returns [`TopologyError`] on invalid YAML or an invalid tree
    pub fn from_yaml(yaml: &str) -> Result<Self, TopologyError> {
        Self::from_value(serde_yaml::from_str(yaml)?)
    }

    #[inline]
    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    #[inline]
    #[must_use]
    pub fn nodes(&self) -> &BTreeMap<String, NodeSpec> {
        &self.nodes
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Raw definition of node `id`
    #[must_use]
    pub fn node_value(&self, id: &str) -> Option<&Value> {
        self.raw.get(NODES)?.get(id)
    }

    /// Entries of a keyed top-level section (`outputs`, `workflows`, ...)
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.raw.get(name)?.as_object()
    }

    /// Edges `(source, target)` of every declared relationship, by source id
    #[must_use]
    pub fn relationship_edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.relationships
                    .iter()
                    .map(move |rel| (node.id.as_str(), rel.target_id.as_str()))
            })
            .collect()
    }
}

impl TryFrom<Value> for Topology {
    type Error = TopologyError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Topology> for Value {
    fn from(topology: Topology) -> Self {
        topology.raw
    }
}

fn normalize_nodes(nodes: Value) -> Result<Map<String, Value>, TopologyError> {
    match nodes {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::Array(items) => {
            let mut map = Map::new();
            for item in items {
                let Value::Object(mut node) = item else {
                    return Err(TopologyError::NotAMapping {
                        section: NODES.to_string(),
                    });
                };
                let id = match node.remove("id") {
                    Some(Value::String(id)) => id,
                    _ => {
                        return Err(TopologyError::InvalidNode {
                            node: "<unnamed>".to_string(),
                            reason: "node in sequence form is missing a string `id`".to_string(),
                        })
                    }
                };
                if map.insert(id.clone(), Value::Object(node)).is_some() {
                    return Err(TopologyError::InvalidNode {
                        node: id,
                        reason: "declared more than once".to_string(),
                    });
                }
            }
            Ok(map)
        }
        _ => Err(TopologyError::NotAMapping {
            section: NODES.to_string(),
        }),
    }
}

fn parse_node(id: &str, value: &Value) -> Result<NodeSpec, TopologyError> {
    validate_identifier(NODES, id)?;
    let raw: RawNode =
        serde_json::from_value(value.clone()).map_err(|e| TopologyError::InvalidNode {
            node: id.to_string(),
            reason: e.to_string(),
        })?;

    for key in raw.properties.keys() {
        validate_identifier(PROPERTIES, key)?;
    }
    for key in raw.operations.keys() {
        validate_identifier(OPERATIONS, key)?;
    }
    if !raw.instances.is_consistent() {
        return Err(TopologyError::InvalidInstanceBounds {
            node: id.to_string(),
            min: raw.instances.min,
            max: raw.instances.max,
            default: raw.instances.default,
        });
    }

    let relationships = raw
        .relationships
        .into_iter()
        .enumerate()
        .map(|(index, rel)| RelationshipSpec {
            rel_type: rel.rel_type,
            target_id: rel.target_id,
            index,
        })
        .collect();

    Ok(NodeSpec {
        id: id.to_string(),
        node_type: raw.node_type,
        instances: raw.instances,
        properties: raw.properties,
        operations: raw.operations,
        relationships,
    })
}

fn validate_relationships(nodes: &BTreeMap<String, NodeSpec>) -> Result<(), TopologyError> {
    for node in nodes.values() {
        let mut seen = BTreeSet::new();
        for rel in &node.relationships {
            if !nodes.contains_key(&rel.target_id) {
                return Err(TopologyError::DanglingRelationship {
                    source_id: node.id.clone(),
                    target_id: rel.target_id.clone(),
                });
            }
            if !seen.insert(rel.target_id.as_str()) {
                return Err(TopologyError::DuplicateRelationship {
                    source_id: node.id.clone(),
                    target_id: rel.target_id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Identifiers become path segments, so they may not contain separators
fn validate_identifier(section: &str, id: &str) -> Result<(), TopologyError> {
    let invalid = id.is_empty()
        || id.contains(crate::path::PATH_SEPARATOR)
        || id.contains(['[', ']'])
        || id.contains(RELATIONSHIP_SEPARATOR);
    if invalid {
        Err(TopologyError::InvalidIdentifier {
            section: section.to_string(),
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Topology validation errors
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("section '{section}' must be a mapping")]
    NotAMapping { section: String },

    #[error("invalid identifier '{id}' in '{section}'")]
    InvalidIdentifier { section: String, id: String },

    #[error("invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("relationship {source_id}::{target_id} targets an undeclared node")]
    DanglingRelationship { source_id: String, target_id: String },

    #[error("relationship {source_id}::{target_id} declared more than once")]
    DuplicateRelationship { source_id: String, target_id: String },

    #[error("node '{node}' has inconsistent instance bounds (min {min}, max {max:?}, default {default})")]
    InvalidInstanceBounds {
        node: String,
        min: u32,
        max: Option<u32>,
        default: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WEB_DB: &str = r"
nodes:
  web:
    type: webserver
    properties: { port: 80 }
    instances: { min: 1, max: 3, default: 2 }
    relationships:
      - { type: connected_to, target_id: db }
  db:
    type: database
outputs:
  endpoint: { value: 'http://web' }
";

    #[test]
    fn topology_from_yaml() {
        let topology = Topology::from_yaml(WEB_DB).unwrap();
        assert_eq!(topology.nodes().len(), 2);
        let web = topology.node("web").unwrap();
        assert_eq!(web.node_type, "webserver");
        assert_eq!(web.instances, InstanceBounds::new(1, Some(3), 2));
        assert_eq!(web.relationship_to("db").unwrap().rel_type, "connected_to");
        assert_eq!(topology.relationship_edges(), vec![("web", "db")]);
        assert!(topology.section("outputs").unwrap().contains_key("endpoint"));
    }

    #[test]
    fn topology_defaults_instances() {
        let topology = Topology::from_value(json!({"nodes": {"a": {"type": "t"}}})).unwrap();
        assert_eq!(topology.node("a").unwrap().instances, InstanceBounds::default());
        assert_eq!(InstanceBounds::default().target(), 1);
    }

    #[test]
    fn topology_normalizes_node_sequence() {
        let as_list = Topology::from_value(json!({
            "nodes": [{"id": "a", "type": "t"}, {"id": "b", "type": "t"}]
        }))
        .unwrap();
        let as_map = Topology::from_value(json!({
            "nodes": {"a": {"type": "t"}, "b": {"type": "t"}}
        }))
        .unwrap();
        assert_eq!(as_list.raw(), as_map.raw());
        assert_eq!(as_list.hash(), as_map.hash());
    }

    #[test]
    fn topology_rejects_dangling_relationship() {
        let result = Topology::from_value(json!({
            "nodes": {"a": {"type": "t", "relationships": [{"type": "r", "target_id": "ghost"}]}}
        }));
        assert!(matches!(result, Err(TopologyError::DanglingRelationship { .. })));
    }

    #[test]
    fn topology_rejects_duplicate_relationship() {
        let result = Topology::from_value(json!({
            "nodes": {
                "a": {"type": "t", "relationships": [
                    {"type": "r1", "target_id": "b"},
                    {"type": "r2", "target_id": "b"}
                ]},
                "b": {"type": "t"}
            }
        }));
        assert!(matches!(result, Err(TopologyError::DuplicateRelationship { .. })));
    }

    #[test]
    fn topology_rejects_separator_in_identifiers() {
        for bad in ["a.b", "a[0]", "a::b", ""] {
            let mut nodes = Map::new();
            nodes.insert(bad.to_string(), json!({"type": "t"}));
            let result = Topology::from_value(json!({ "nodes": nodes }));
            assert!(
                matches!(result, Err(TopologyError::InvalidIdentifier { .. })),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn topology_rejects_inconsistent_bounds() {
        let result = Topology::from_value(json!({
            "nodes": {"a": {"type": "t", "instances": {"min": 3, "default": 1}}}
        }));
        assert!(matches!(result, Err(TopologyError::InvalidInstanceBounds { .. })));
    }

    #[test]
    fn topology_rejects_missing_type() {
        let result = Topology::from_value(json!({"nodes": {"a": {}}}));
        assert!(matches!(result, Err(TopologyError::InvalidNode { .. })));
    }

    #[test]
    fn topology_rejects_non_mapping_sections() {
        assert!(matches!(
            Topology::from_value(json!([1, 2])),
            Err(TopologyError::NotAMapping { .. })
        ));
        assert!(matches!(
            Topology::from_value(json!({"nodes": {}, "outputs": [1]})),
            Err(TopologyError::NotAMapping { .. })
        ));
    }

    #[test]
    fn instance_bounds_clamp() {
        let bounds = InstanceBounds::new(1, Some(3), 2);
        assert_eq!(bounds.clamp(0), 1);
        assert_eq!(bounds.clamp(9), 3);
        assert_eq!(bounds.clamp(2), 2);
        assert_eq!(InstanceBounds::new(0, None, 7).clamp(100), 100);
    }

    #[test]
    fn topology_serde_is_raw_tree() {
        let topology = Topology::from_yaml(WEB_DB).unwrap();
        let encoded = serde_json::to_value(&topology).unwrap();
        assert_eq!(&encoded, topology.raw());
        let decoded: Topology = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, topology);
    }
}
