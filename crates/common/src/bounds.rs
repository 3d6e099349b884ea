use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in world space.
///
/// All containment and overlap tests treat the faces as part of the box, so a
/// point sitting exactly on `max` is still inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Build a box from two corners; the corners may be given in any order.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        let half = half_extents.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Cube of side `2 * half` centered on the origin.
    pub fn cube(half: f32) -> Self {
        Self::from_center_half_extents(Vec3::ZERO, Vec3::splat(half))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Sphere overlap via the closest point of the box to the sphere center.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        let closest = center.clamp(self.min, self.max);
        closest.distance_squared(center) <= radius * radius
    }

    /// Octant index of `p` relative to the box center.
    ///
    /// Bit 0 is set when `p.x >= center.x`, bit 1 for y, bit 2 for z. A point on
    /// a splitting plane therefore goes to the upper half on that axis, which
    /// matches the inclusive `min` of the upper child from [`Aabb::octant_bounds`].
    pub fn octant_of(&self, p: Vec3) -> usize {
        let c = self.center();
        let mut index = 0;
        if p.x >= c.x {
            index |= 1;
        }
        if p.y >= c.y {
            index |= 2;
        }
        if p.z >= c.z {
            index |= 4;
        }
        index
    }

    /// Bounds of child octant `index` (0..8) using the [`Aabb::octant_of`] bit layout.
    pub fn octant_bounds(&self, index: usize) -> Aabb {
        debug_assert!(index < 8, "octant index out of range: {index}");
        let c = self.center();
        let pick = |bit: usize, lo: f32, mid: f32, hi: f32| {
            if index & bit != 0 { (mid, hi) } else { (lo, mid) }
        };
        let (x0, x1) = pick(1, self.min.x, c.x, self.max.x);
        let (y0, y1) = pick(2, self.min.y, c.y, self.max.y);
        let (z0, z1) = pick(4, self.min.z, c.z, self.max.z);
        Aabb {
            min: Vec3::new(x0, y0, z0),
            max: Vec3::new(x1, y1, z1),
        }
    }
}
