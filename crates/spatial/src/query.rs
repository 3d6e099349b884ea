use glam::Vec3;
use orrery_common::{Aabb, BodyId};
use std::time::Duration;

/// Region a spatial query was run against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryShape {
    Sphere { center: Vec3, radius: f32 },
    Box(Aabb),
}

/// Snapshot returned by every spatial query. Never mutated after return.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialQueryResult {
    /// Bodies that passed the exact containment test.
    pub bodies: Vec<BodyId>,
    pub shape: QueryShape,
    /// Nodes whose bounds were tested; lower means better pruning.
    pub nodes_visited: usize,
    pub elapsed: Duration,
}

impl SpatialQueryResult {
    pub(crate) fn empty(shape: QueryShape) -> Self {
        Self {
            bodies: Vec::new(),
            shape,
            nodes_visited: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.bodies.contains(&id)
    }
}
