//! Ordered units of work

use depup_topology::{ChangeOperation, EntityId, EntityType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// One step of a migration plan
///
/// `sequence_index` is dense (`0..n`) and defines the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the plan
    pub sequence_index: u32,
    /// Kind of entity touched
    pub entity_type: EntityType,
    /// What happens to it
    pub operation: ChangeOperation,
    /// Entity identifier
    pub entity_id: EntityId,
    /// Minimal topology skeleton carrying the new definition, for additions
    /// and modifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Step {
    /// Node this step belongs to, if node-scoped
    #[inline]
    #[must_use]
    pub fn owning_node(&self) -> Option<&str> {
        self.entity_id.owning_node(self.entity_type)
    }

    /// Check whether this step is `operation` on `entity_type`
    #[inline]
    #[must_use]
    pub fn is(&self, operation: ChangeOperation, entity_type: EntityType) -> bool {
        self.operation == operation && self.entity_type == entity_type
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.operation, self.entity_type, self.entity_id)
    }
}
