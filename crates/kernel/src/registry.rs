use glam::Vec3;
use orrery_common::{Aabb, BodyId, SplitMix64};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An event record produced by every mutation of the body table.
///
/// Consumers (spatial indexes, HUD overlays) can drain the log once per frame
/// and apply the changes instead of diffing the whole table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyEvent {
    /// Body was registered at the given position.
    Spawned { id: BodyId, position: Vec3 },
    /// Body was removed. Carries its last position.
    Despawned { id: BodyId, position: Vec3 },
    /// Body moved.
    Moved { id: BodyId, old: Vec3, new: Vec3 },
}

/// Owner of every body's lifetime and current position.
///
/// Uses BTreeMap for deterministic iteration order, so rebuilding an index
/// from the registry always inserts in the same sequence.
#[derive(Debug, Clone, Default)]
pub struct BodyRegistry {
    bodies: BTreeMap<BodyId, Vec3>,
    next_id: u64,
    event_log: Vec<BodyEvent>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bodies.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Register a new body and return its handle.
    pub fn spawn(&mut self, position: Vec3) -> BodyId {
        let id = BodyId(self.next_id);
        self.spawn_with_id(id, position);
        id
    }

    /// Register a body under a caller-chosen handle (replay, tests).
    ///
    /// Later calls to [`BodyRegistry::spawn`] skip past this id.
    pub fn spawn_with_id(&mut self, id: BodyId, position: Vec3) {
        self.next_id = self.next_id.max(id.0 + 1);
        self.bodies.insert(id, position);
        self.event_log.push(BodyEvent::Spawned { id, position });
    }

    /// Scatter `count` bodies uniformly inside `bounds` from a fixed seed.
    pub fn scatter(&mut self, count: usize, bounds: Aabb, seed: u64) -> Vec<BodyId> {
        let mut rng = SplitMix64::new(seed);
        (0..count)
            .map(|_| self.spawn(rng.point_in(bounds.min, bounds.max)))
            .collect()
    }

    /// Remove a body. Returns its last position if it existed.
    pub fn despawn(&mut self, id: BodyId) -> Option<Vec3> {
        let position = self.bodies.remove(&id);
        if let Some(position) = position {
            tracing::trace!(%id, "body despawned");
            self.event_log.push(BodyEvent::Despawned { id, position });
        }
        position
    }

    pub fn position(&self, id: BodyId) -> Option<Vec3> {
        self.bodies.get(&id).copied()
    }

    pub fn is_alive(&self, id: BodyId) -> bool {
        self.bodies.contains_key(&id)
    }

    /// Move a body and log the change. Returns false for unknown handles.
    pub fn set_position(&mut self, id: BodyId, new: Vec3) -> bool {
        if let Some(slot) = self.bodies.get_mut(&id) {
            let old = *slot;
            *slot = new;
            self.event_log.push(BodyEvent::Moved { id, old, new });
            true
        } else {
            false
        }
    }

    /// Iterate live bodies in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (BodyId, Vec3)> + '_ {
        self.bodies.iter().map(|(id, p)| (*id, *p))
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[BodyEvent] {
        &self.event_log
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<BodyEvent> {
        std::mem::take(&mut self.event_log)
    }
}
