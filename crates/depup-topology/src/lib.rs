//! Deployment topology model and structural diffing
//!
//! # Core Concepts
//!
//! - [`Breadcrumbs`]: dotted paths with bracket indexes (`nodes.n2[1].inner[0]`)
//!   for addressing values inside a topology tree
//! - [`ContentHash`]: Blake3 fingerprint over canonical JSON
//! - [`Topology`]: validated deployment topology (nodes, relationships, outputs,
//!   workflows, groups, policies)
//! - [`Change`]: one typed, addressed difference between two topologies
//! - [`diff`] / [`apply`]: compute and re-materialize changes
//!
//! # Example
//!
//! ```rust,ignore
//! use depup_topology::{diff, Topology};
//!
//! let old = Topology::from_yaml(old_yaml)?;
//! let new = Topology::from_yaml(new_yaml)?;
//! for change in diff(&old, &new) {
//!     println!("{change}");
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod change;
mod diff;
mod hash;
mod path;
mod topology;

pub use change::{Change, ChangeOperation, EntityId, EntityType};
pub use diff::{apply, diff, ApplyError};
pub use hash::{ContentHash, HashError};
pub use path::{
    create_skeleton, parse_index, traverse, Breadcrumbs, PathError, Segment, MAX_SKELETON_INDEX,
    PATH_SEPARATOR,
};
pub use topology::{
    InstanceBounds, NodeSpec, RelationshipSpec, Topology, TopologyError, RELATIONSHIP_SEPARATOR,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
