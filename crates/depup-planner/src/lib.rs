//! Deployment update planning
//!
//! Turns the [`Change`](depup_topology::Change)s produced by the differ into
//! an ordered migration plan.
//!
//! # Core Concepts
//!
//! - [`Bucket`]: fixed execution phase of a change (relationship removals
//!   first, relationship additions last)
//! - [`Step`]: one ordered unit of work
//! - [`InstanceDelta`]: how many node instances to create or delete
//! - [`ModifiedEntities`]: append-only audit of everything the plan touches
//! - [`Planner`]: produces a [`MigrationPlan`]
//!
//! # Example
//!
//! ```rust,ignore
//! use depup_planner::{LiveState, Planner};
//! use depup_topology::diff;
//!
//! let changes = diff(&current, &candidate);
//! let plan = Planner::new().plan(&changes, &LiveState::new())?;
//! for step in &plan.steps {
//!     println!("{step}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod bucket;
mod instances;
mod modified;
mod planner;
mod step;

pub use bucket::{bucket_of, Bucket};
pub use instances::{InstanceDelta, LiveNode, LiveState};
pub use modified::ModifiedEntities;
pub use planner::{MigrationPlan, PlanError, Planner};
pub use step::Step;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
