//! Body Kernel: the authoritative table of simulated bodies.
//!
//! # Invariants
//! - Body handles are never reused within one registry.
//! - All mutations flow through explicit operations and are logged.
//! - Spatial indexes hold handles only; a despawned handle simply stops resolving.

pub mod registry;

pub use registry::{BodyEvent, BodyRegistry};
