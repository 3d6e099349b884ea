use glam::Vec3;
use orrery_common::BodyId;
use orrery_kernel::BodyRegistry;
use std::collections::HashMap;

/// Resolves a body handle to the body's current position.
///
/// `None` means the body has expired: its owner removed it and the index
/// should drop the handle the next time it is touched.
pub trait BodyLookup {
    fn body_position(&self, id: BodyId) -> Option<Vec3>;

    /// Every live body with its current position.
    fn live_bodies(&self) -> Vec<(BodyId, Vec3)>;
}

impl BodyLookup for BodyRegistry {
    fn body_position(&self, id: BodyId) -> Option<Vec3> {
        self.position(id)
    }

    fn live_bodies(&self) -> Vec<(BodyId, Vec3)> {
        self.iter().collect()
    }
}

impl BodyLookup for HashMap<BodyId, Vec3> {
    fn body_position(&self, id: BodyId) -> Option<Vec3> {
        self.get(&id).copied()
    }

    fn live_bodies(&self) -> Vec<(BodyId, Vec3)> {
        self.iter().map(|(id, position)| (*id, *position)).collect()
    }
}
