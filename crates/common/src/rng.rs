use glam::Vec3;

/// Splitmix64 generator: tiny, fast and reproducible across platforms.
///
/// Used for scattering demo bodies and for seeding procedural tile content,
/// where the same seed must always produce the same sequence.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        mix(self.state)
    }

    /// Uniform float in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        // 24 high bits fit exactly in an f32 mantissa.
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform float in `[min, max)`.
    pub fn range_f32(&mut self, min: f32, max: f32) -> f32 {
        min + (max - min) * self.next_f32()
    }

    /// Uniform point inside the box spanned by `min` and `max`.
    pub fn point_in(&mut self, min: Vec3, max: Vec3) -> Vec3 {
        Vec3::new(
            self.range_f32(min.x, max.x),
            self.range_f32(min.y, max.y),
            self.range_f32(min.z, max.z),
        )
    }
}

/// Stateless splitmix64 finalizer, handy as an integer hash.
pub(crate) fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl SplitMix64 {
    /// Hash an integer lattice coordinate together with a seed.
    pub fn hash3(seed: u64, x: i64, y: i64, z: i64) -> u64 {
        let mut h = mix(seed.wrapping_add(0x9e37_79b9_7f4a_7c15));
        h = mix(h ^ x as u64);
        h = mix(h ^ y as u64);
        mix(h ^ z as u64)
    }
}
