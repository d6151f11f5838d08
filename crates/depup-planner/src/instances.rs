//! Node-instance scaling deltas

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Live view of one node, as read from storage at planning time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LiveNode {
    /// Optimistic version of the node row
    pub version: u64,
    /// Number of currently live instances
    pub live_instances: u32,
}

impl LiveNode {
    /// Create a live node snapshot
    #[inline]
    #[must_use]
    pub fn new(version: u64, live_instances: u32) -> Self {
        Self {
            version,
            live_instances,
        }
    }
}

/// Live nodes of a deployment, keyed by node id
pub type LiveState = BTreeMap<String, LiveNode>;

/// Instance-count change for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDelta {
    /// Live instances when the plan was made
    pub current: u32,
    /// Instances wanted after the update
    pub target: u32,
}

impl InstanceDelta {
    /// Create a delta from `current` to `target`
    #[inline]
    #[must_use]
    pub fn new(current: u32, target: u32) -> Self {
        Self { current, target }
    }

    /// Signed difference (`target - current`)
    #[inline]
    #[must_use]
    pub fn delta(&self) -> i64 {
        i64::from(self.target) - i64::from(self.current)
    }

    /// Instances to create
    #[inline]
    #[must_use]
    pub fn additions(&self) -> u32 {
        self.target.saturating_sub(self.current)
    }

    /// Instances to delete
    #[inline]
    #[must_use]
    pub fn removals(&self) -> u32 {
        self.current.saturating_sub(self.target)
    }

    /// No instances change
    #[inline]
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.current == self.target
    }
}
