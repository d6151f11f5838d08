//! Typed, addressed differences between two topologies

use crate::path::Breadcrumbs;
use crate::topology::{NODES, OPERATIONS, PROPERTIES, RELATIONSHIP_SEPARATOR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Kind of topology entity a [`Change`] addresses
///
/// Closed set: every consumer matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Node,
    Relationship,
    Property,
    Output,
    Workflow,
    Group,
    Policy,
    Operation,
}

impl EntityType {
    /// All entity types, in declaration order
    pub const ALL: [Self; 8] = [
        Self::Node,
        Self::Relationship,
        Self::Property,
        Self::Output,
        Self::Workflow,
        Self::Group,
        Self::Policy,
        Self::Operation,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Relationship => "relationship",
            Self::Property => "property",
            Self::Output => "output",
            Self::Workflow => "workflow",
            Self::Group => "group",
            Self::Policy => "policy",
            Self::Operation => "operation",
        }
    }

    /// Top-level section holding entities of this type
    ///
    /// Relationships, properties and operations live under `nodes`.
    #[must_use]
    pub const fn section(self) -> &'static str {
        match self {
            Self::Node | Self::Relationship | Self::Property | Self::Operation => NODES,
            Self::Output => "outputs",
            Self::Workflow => "workflows",
            Self::Group => "groups",
            Self::Policy => "policies",
        }
    }

    /// Sub-key of a node that holds entities of this type, for node-scoped types
    #[must_use]
    pub const fn node_scope(self) -> Option<&'static str> {
        match self {
            Self::Property => Some(PROPERTIES),
            Self::Operation => Some(OPERATIONS),
            Self::Node
            | Self::Relationship
            | Self::Output
            | Self::Workflow
            | Self::Group
            | Self::Policy => None,
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown entity type: {s}"))
    }
}

/// What happened to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Add,
    Remove,
    Modify,
}

impl ChangeOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
            Self::Modify => "MODIFY",
        }
    }
}

impl Display for ChangeOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an entity, relative to its type's section
///
/// # Examples
/// - node `web`
/// - relationship `web::db`
/// - property `web.properties.port`
/// - output `endpoint`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Relationship id `{source}::{target}`
    #[must_use]
    pub fn relationship(source: &str, target: &str) -> Self {
        Self(format!("{source}{RELATIONSHIP_SEPARATOR}{target}"))
    }

    /// Node-scoped id `{node}.{scope}.{key}` (properties, operations)
    #[must_use]
    pub fn scoped(node: &str, scope: &str, key: &str) -> Self {
        Self(format!("{node}.{scope}.{key}"))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(source, target)` of a relationship id
    #[must_use]
    pub fn relationship_endpoints(&self) -> Option<(&str, &str)> {
        self.0.split_once(RELATIONSHIP_SEPARATOR)
    }

    /// Node this entity belongs to, if it is node-scoped
    #[must_use]
    pub fn owning_node(&self, entity_type: EntityType) -> Option<&str> {
        match entity_type {
            EntityType::Node => Some(&self.0),
            EntityType::Relationship => self.relationship_endpoints().map(|(source, _)| source),
            EntityType::Property | EntityType::Operation => self.0.split('.').next(),
            EntityType::Output | EntityType::Workflow | EntityType::Group | EntityType::Policy => {
                None
            }
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One difference between an old and a new topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub entity_type: EntityType,
    pub operation: ChangeOperation,
    pub entity_id: EntityId,
    /// Location in the new topology (old topology for removals)
    pub path: Breadcrumbs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl Change {
    #[must_use]
    pub fn add(entity_type: EntityType, entity_id: EntityId, path: Breadcrumbs, new_value: Value) -> Self {
        Self {
            entity_type,
            operation: ChangeOperation::Add,
            entity_id,
            path,
            old_value: None,
            new_value: Some(new_value),
        }
    }

    #[must_use]
    pub fn remove(entity_type: EntityType, entity_id: EntityId, path: Breadcrumbs, old_value: Value) -> Self {
        Self {
            entity_type,
            operation: ChangeOperation::Remove,
            entity_id,
            path,
            old_value: Some(old_value),
            new_value: None,
        }
    }

    #[must_use]
    pub fn modify(
        entity_type: EntityType,
        entity_id: EntityId,
        path: Breadcrumbs,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        Self {
            entity_type,
            operation: ChangeOperation::Modify,
            entity_id,
            path,
            old_value: Some(old_value),
            new_value: Some(new_value),
        }
    }

    #[inline]
    #[must_use]
    pub fn owning_node(&self) -> Option<&str> {
        self.entity_id.owning_node(self.entity_type)
    }
}

impl Display for Change {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.operation, self.entity_type, self.entity_id)
    }
}
