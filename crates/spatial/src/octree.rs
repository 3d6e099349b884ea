use glam::Vec3;
use orrery_common::{Aabb, BodyId};
use orrery_kernel::BodyEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::lookup::BodyLookup;
use crate::query::{QueryShape, SpatialQueryResult};

/// Octree shared between threads. Readers may query concurrently; any
/// mutation takes the write lock.
pub type SharedOctree = Arc<RwLock<Octree>>;

/// Split thresholds for the octree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeConfig {
    /// A leaf splits once it holds more bodies than this.
    pub max_bodies_per_node: usize,
    /// Leaves at this depth never split and accept any number of bodies.
    pub max_depth: u32,
}

impl Default for OctreeConfig {
    fn default() -> Self {
        Self {
            max_bodies_per_node: 8,
            max_depth: 6,
        }
    }
}

/// Deepest `max_depth` accepted. Past this, child cells of any realistic
/// world are smaller than f32 can separate.
pub const MAX_OCTREE_DEPTH: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OctreeConfigError {
    #[error("max_bodies_per_node must be at least 1")]
    ZeroCapacity,
    #[error("max_depth {0} exceeds the limit of {MAX_OCTREE_DEPTH}")]
    DepthTooLarge(u32),
}

impl OctreeConfig {
    pub fn validate(&self) -> Result<(), OctreeConfigError> {
        if self.max_bodies_per_node == 0 {
            return Err(OctreeConfigError::ZeroCapacity);
        }
        if self.max_depth > MAX_OCTREE_DEPTH {
            return Err(OctreeConfigError::DepthTooLarge(self.max_depth));
        }
        Ok(())
    }

    /// Nearest valid config: capacity raised to 1, depth capped.
    pub fn clamped(self) -> Self {
        Self {
            max_bodies_per_node: self.max_bodies_per_node.max(1),
            max_depth: self.max_depth.min(MAX_OCTREE_DEPTH),
        }
    }
}

/// Shape statistics for profiling overlays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OctreeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub body_count: usize,
    /// Deepest node currently allocated.
    pub max_depth: u32,
    /// Largest body count held by a single leaf.
    pub max_leaf_bodies: usize,
}

struct OctreeNode {
    bounds: Aabb,
    depth: u32,
    bodies: Vec<(BodyId, Vec3)>,
    children: Option<Box<[OctreeNode; 8]>>,
}

impl OctreeNode {
    fn leaf(bounds: Aabb, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            bodies: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, id: BodyId, position: Vec3, config: &OctreeConfig) {
        match &mut self.children {
            Some(children) => {
                let octant = self.bounds.octant_of(position);
                children[octant].insert(id, position, config);
            }
            None => {
                self.bodies.push((id, position));
                if self.should_split(config) {
                    self.split(config);
                }
            }
        }
    }

    fn should_split(&self, config: &OctreeConfig) -> bool {
        self.bodies.len() > config.max_bodies_per_node && self.depth < config.max_depth
    }

    /// Turn this leaf into 8 children and push its bodies down, recursing into
    /// any child that is immediately over capacity.
    fn split(&mut self, config: &OctreeConfig) {
        debug_assert!(self.children.is_none(), "split called on interior node");
        debug_assert!(
            self.depth < config.max_depth,
            "split past max depth {}",
            config.max_depth
        );
        let bounds = self.bounds;
        let depth = self.depth + 1;
        let mut children: Box<[OctreeNode; 8]> = Box::new(std::array::from_fn(|i| {
            OctreeNode::leaf(bounds.octant_bounds(i), depth)
        }));
        for (id, position) in self.bodies.drain(..) {
            children[bounds.octant_of(position)]
                .bodies
                .push((id, position));
        }
        for child in children.iter_mut() {
            if child.should_split(config) {
                child.split(config);
            }
        }
        tracing::trace!(depth = self.depth, "octree node split");
        self.children = Some(children);
    }

    /// Remove by descending along `position`, the body's last known location.
    fn remove_at(&mut self, id: BodyId, position: Vec3) -> bool {
        match &mut self.children {
            Some(children) => {
                let octant = self.bounds.octant_of(position);
                children[octant].remove_at(id, position)
            }
            None => self.remove_local(id),
        }
    }

    /// Fallback removal that searches every leaf.
    fn remove_scan(&mut self, id: BodyId) -> bool {
        match &mut self.children {
            Some(children) => children.iter_mut().any(|c| c.remove_scan(id)),
            None => self.remove_local(id),
        }
    }

    fn remove_local(&mut self, id: BodyId) -> bool {
        match self.bodies.iter().position(|(b, _)| *b == id) {
            Some(index) => {
                self.bodies.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn collect_sphere(
        &self,
        center: Vec3,
        radius: f32,
        out: &mut Vec<BodyId>,
        visited: &mut usize,
    ) {
        *visited += 1;
        if !self.bounds.intersects_sphere(center, radius) {
            return;
        }
        let r2 = radius * radius;
        out.extend(
            self.bodies
                .iter()
                .filter(|(_, p)| p.distance_squared(center) <= r2)
                .map(|(id, _)| *id),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.collect_sphere(center, radius, out, visited);
            }
        }
    }

    fn collect_box(&self, region: &Aabb, out: &mut Vec<BodyId>, visited: &mut usize) {
        *visited += 1;
        if !self.bounds.intersects(region) {
            return;
        }
        out.extend(
            self.bodies
                .iter()
                .filter(|(_, p)| region.contains_point(*p))
                .map(|(id, _)| *id),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.collect_box(region, out, visited);
            }
        }
    }

    fn visit(&self, f: &mut impl FnMut(&OctreeNode)) {
        f(self);
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.visit(f);
            }
        }
    }
}

/// Dynamic octree over point bodies.
///
/// Bodies are tracked by handle with their last known position; the tree does
/// not follow motion on its own, so every move must go through
/// [`Octree::update_body_position`] (or [`Octree::apply_events`]).
pub struct Octree {
    config: OctreeConfig,
    root: Option<OctreeNode>,
    locations: HashMap<BodyId, Vec3>,
}

impl Octree {
    /// Create an index that still needs [`Octree::initialize`] before use.
    ///
    /// An invalid config is clamped (see [`OctreeConfig::clamped`]); call
    /// [`OctreeConfig::validate`] first to reject it instead.
    pub fn new(config: OctreeConfig) -> Self {
        if let Err(error) = config.validate() {
            tracing::warn!(%error, "octree config clamped");
        }
        Self {
            config: config.clamped(),
            root: None,
            locations: HashMap::new(),
        }
    }

    /// Create and initialize in one go.
    pub fn with_bounds(config: OctreeConfig, bounds: Aabb) -> Self {
        let mut tree = Self::new(config);
        tree.initialize(bounds);
        tree
    }

    /// Reset to an empty root covering `bounds`, discarding all prior state.
    pub fn initialize(&mut self, bounds: Aabb) {
        tracing::debug!(min = ?bounds.min, max = ?bounds.max, "octree initialized");
        self.root = Some(OctreeNode::leaf(bounds, 0));
        self.locations.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.root.is_some()
    }

    pub fn config(&self) -> &OctreeConfig {
        &self.config
    }

    /// World bounds covered by the root, if initialized.
    pub fn bounds(&self) -> Option<Aabb> {
        self.root.as_ref().map(|r| r.bounds)
    }

    /// Insert a body. Returns false (and changes nothing) when the index is
    /// uninitialized or `position` lies outside the world bounds.
    ///
    /// Adding a handle that is already present relocates it instead of
    /// storing a second copy.
    pub fn add_body(&mut self, id: BodyId, position: Vec3) -> bool {
        let Some(root) = self.root.as_ref() else {
            tracing::debug!(%id, "add_body before initialize ignored");
            return false;
        };
        if !root.bounds.contains_point(position) {
            tracing::debug!(%id, ?position, "body outside world bounds dropped");
            return false;
        }
        if self.locations.contains_key(&id) {
            self.remove_body(id);
        }
        let config = self.config;
        if let Some(root) = self.root.as_mut() {
            root.insert(id, position, &config);
            self.locations.insert(id, position);
        }
        true
    }

    /// Remove a body. Returns false if it was not in the tree.
    pub fn remove_body(&mut self, id: BodyId) -> bool {
        let Some(position) = self.locations.remove(&id) else {
            return false;
        };
        let Some(root) = self.root.as_mut() else {
            return false;
        };
        if root.remove_at(id, position) {
            return true;
        }
        tracing::warn!(%id, "body missing from expected leaf, scanning");
        root.remove_scan(id)
    }

    /// Move a tracked body. Returns false for unknown handles, or when the new
    /// position is out of bounds (the body is then no longer in the tree).
    pub fn update_body_position(&mut self, id: BodyId, position: Vec3) -> bool {
        if !self.locations.contains_key(&id) {
            return false;
        }
        self.remove_body(id);
        self.add_body(id, position)
    }

    /// Apply a batch of body-table mutations in order.
    pub fn apply_events(&mut self, events: &[BodyEvent]) {
        for event in events {
            match event {
                BodyEvent::Spawned { id, position } => {
                    self.add_body(*id, *position);
                }
                BodyEvent::Despawned { id, .. } => {
                    self.remove_body(*id);
                }
                // A body that left the world and came back is untracked.
                BodyEvent::Moved { id, new, .. } => {
                    if self.contains_body(*id) {
                        self.update_body_position(*id, *new);
                    } else {
                        self.add_body(*id, *new);
                    }
                }
            }
        }
    }

    /// All bodies within `radius` of `center` (distance <= radius).
    pub fn query_bodies_in_radius(&self, center: Vec3, radius: f32) -> SpatialQueryResult {
        let shape = QueryShape::Sphere { center, radius };
        // Also rejects NaN.
        if !(radius >= 0.0) {
            return SpatialQueryResult::empty(shape);
        }
        let Some(root) = self.root.as_ref() else {
            return SpatialQueryResult::empty(shape);
        };
        let start = Instant::now();
        let mut bodies = Vec::new();
        let mut nodes_visited = 0;
        root.collect_sphere(center, radius, &mut bodies, &mut nodes_visited);
        SpatialQueryResult {
            bodies,
            shape,
            nodes_visited,
            elapsed: start.elapsed(),
        }
    }

    /// All bodies inside `region`, faces included.
    pub fn query_bodies_in_box(&self, region: Aabb) -> SpatialQueryResult {
        let shape = QueryShape::Box(region);
        let Some(root) = self.root.as_ref() else {
            return SpatialQueryResult::empty(shape);
        };
        let start = Instant::now();
        let mut bodies = Vec::new();
        let mut nodes_visited = 0;
        root.collect_box(&region, &mut bodies, &mut nodes_visited);
        SpatialQueryResult {
            bodies,
            shape,
            nodes_visited,
            elapsed: start.elapsed(),
        }
    }

    /// Every body in the tree, in traversal order.
    pub fn all_bodies(&self) -> Vec<BodyId> {
        let mut out = Vec::with_capacity(self.locations.len());
        if let Some(root) = &self.root {
            root.visit(&mut |node| out.extend(node.bodies.iter().map(|(id, _)| *id)));
        }
        out
    }

    pub fn contains_body(&self, id: BodyId) -> bool {
        self.locations.contains_key(&id)
    }

    /// Last position the tree recorded for `id`.
    pub fn body_position(&self, id: BodyId) -> Option<Vec3> {
        self.locations.get(&id).copied()
    }

    pub fn body_count(&self) -> usize {
        self.locations.len()
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        if let Some(root) = &self.root {
            root.visit(&mut |_| count += 1);
        }
        count
    }

    pub fn stats(&self) -> OctreeStats {
        let mut stats = OctreeStats::default();
        if let Some(root) = &self.root {
            root.visit(&mut |node| {
                stats.node_count += 1;
                stats.max_depth = stats.max_depth.max(node.depth);
                if node.children.is_none() {
                    stats.leaf_count += 1;
                    stats.body_count += node.bodies.len();
                    stats.max_leaf_bodies = stats.max_leaf_bodies.max(node.bodies.len());
                }
            });
        }
        stats
    }

    /// Drop every body and node, keeping an empty root with the same bounds.
    pub fn clear(&mut self) {
        if let Some(bounds) = self.bounds() {
            self.root = Some(OctreeNode::leaf(bounds, 0));
        }
        self.locations.clear();
    }

    /// Re-insert every tracked body into a fresh tree. This is the only way
    /// to reclaim nodes left behind by removals.
    pub fn rebuild(&mut self) {
        let mut bodies: Vec<(BodyId, Vec3)> =
            self.locations.iter().map(|(k, v)| (*k, *v)).collect();
        bodies.sort_by_key(|(id, _)| *id);
        let before = self.node_count();
        self.clear();
        for (id, position) in bodies {
            self.add_body(id, position);
        }
        tracing::debug!(before, after = self.node_count(), "octree rebuilt");
    }

    /// Rebuild from every live body `lookup` knows about, at its current
    /// position. Expired bodies are dropped and bodies the tree had lost
    /// track of (out of bounds earlier, missed events) come back if they are
    /// inside the world now. Returns the number of bodies inserted.
    pub fn rebuild_from(&mut self, lookup: &impl BodyLookup) -> usize {
        let mut bodies = lookup.live_bodies();
        bodies.sort_by_key(|(id, _)| *id);
        self.clear();
        let inserted = bodies
            .into_iter()
            .filter(|(id, position)| self.add_body(*id, *position))
            .count();
        tracing::debug!(inserted, "octree rebuilt from lookup");
        inserted
    }

    /// Remove every body whose handle no longer resolves. Returns how many
    /// were removed.
    pub fn prune_expired(&mut self, lookup: &impl BodyLookup) -> usize {
        let expired: Vec<BodyId> = self
            .locations
            .keys()
            .filter(|id| lookup.body_position(**id).is_none())
            .copied()
            .collect();
        for id in &expired {
            self.remove_body(*id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "pruned expired bodies");
        }
        expired.len()
    }

    #[cfg(test)]
    fn leaves(&self) -> Vec<(u32, usize)> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.visit(&mut |node| {
                if node.children.is_none() {
                    out.push((node.depth, node.bodies.len()));
                } else {
                    assert!(node.bodies.is_empty(), "interior node holds bodies");
                }
            });
        }
        out
    }
}

impl std::fmt::Debug for Octree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Octree")
            .field("config", &self.config)
            .field("bounds", &self.bounds())
            .field("bodies", &self.locations.len())
            .finish_non_exhaustive()
    }
}
