//! Spatial: hierarchical partitioning of world space over moving bodies.
//!
//! # Invariants
//! - A body lives in at most one leaf at a time.
//! - A leaf holds more than `max_bodies_per_node` bodies only at `max_depth`.
//! - Interior nodes hold no bodies directly.
//! - The tree never merges nodes on removal; call [`Octree::rebuild`]
//!   periodically in long sessions to reclaim over-split regions.
//!
//! # Threading
//! [`Octree`] assumes a single owner. Share it across threads through
//! [`SharedOctree`], which takes a reader/writer lock around every access.

mod lookup;
mod octree;
mod query;

pub use lookup::BodyLookup;
pub use octree::{
    MAX_OCTREE_DEPTH, Octree, OctreeConfig, OctreeConfigError, OctreeStats, SharedOctree,
};
pub use query::{QueryShape, SpatialQueryResult};

pub fn crate_info() -> &'static str {
    "orrery-spatial v0.1.0"
}
