//! Common: identity handles, axis-aligned bounds and deterministic randomness
//! shared by the spatial index and the terrain streamer.
//!
//! # Invariants
//! - Handles are plain integers; nothing here owns a body or a tile.
//! - Bounds tests are inclusive on every face.

mod bounds;
mod rng;
mod types;

pub use bounds::Aabb;
pub use rng::SplitMix64;
pub use types::{BodyId, RequestId};

pub fn crate_info() -> &'static str {
    "orrery-common v0.1.0"
}
