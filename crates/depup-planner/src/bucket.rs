//! Execution phases for planned changes
//!
//! Every `(entity type, operation)` pair maps to exactly one [`Bucket`].
//! Buckets execute in declaration order, which guarantees that relationships
//! are torn down before the nodes they reference disappear, and that nodes
//! exist before relationships targeting them are established.

use depup_topology::{ChangeOperation, EntityType};
use serde::{Deserialize, Serialize};

/// Phase of a migration plan, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Relationship removals
    RemoveRelationship,
    /// Node removals (and their instances)
    RemoveNode,
    /// Changes applied while the node set is fixed
    Mutate,
    /// Node additions (and their instances)
    AddNode,
    /// Relationship additions
    AddRelationship,
}

/// Bucket a change belongs to
///
/// Property changes stay in [`Bucket::Mutate`] even when the owning node also
/// gains or loses relationships in the same plan.
#[must_use]
pub fn bucket_of(entity_type: EntityType, operation: ChangeOperation) -> Bucket {
    use ChangeOperation::{Add, Modify, Remove};
    use EntityType::{Group, Node, Operation, Output, Policy, Property, Relationship, Workflow};

    match (entity_type, operation) {
        (Relationship, Remove) => Bucket::RemoveRelationship,
        (Node, Remove) => Bucket::RemoveNode,
        (Node, Add) => Bucket::AddNode,
        (Relationship, Add) => Bucket::AddRelationship,
        (Node | Relationship, Modify)
        | (Property | Output | Workflow | Group | Policy | Operation, Add | Remove | Modify) => {
            Bucket::Mutate
        }
    }
}
