use glam::Vec3;
use orrery_common::SplitMix64;
use std::sync::Arc;

use crate::request::TileParams;

/// A generated heightfield tile. Cloning shares the sample buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TileData {
    pub position: Vec3,
    pub size: f32,
    pub lod: u32,
    pub resolution: u32,
    /// Row-major `resolution * resolution` height samples.
    pub heights: Arc<[f32]>,
}

impl TileData {
    /// Height at grid cell `(x, y)`, if inside the tile.
    pub fn sample(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.resolution || y >= self.resolution {
            return None;
        }
        self.heights
            .get((y * self.resolution + x) as usize)
            .copied()
    }

    pub fn sample_count(&self) -> usize {
        self.heights.len()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("invalid tile parameters: {0}")]
    InvalidParams(String),
    #[error("generator failed: {0}")]
    Failed(String),
    #[error("generator panicked: {0}")]
    Panicked(String),
}

/// Produces tile content. Called from worker threads, so it must be shareable
/// and must not assume which thread it runs on.
pub trait TileGenerator: Send + Sync + 'static {
    fn generate(&self, params: &TileParams) -> Result<TileData, GenerationError>;
}

impl<F> TileGenerator for F
where
    F: Fn(&TileParams) -> Result<TileData, GenerationError> + Send + Sync + 'static,
{
    fn generate(&self, params: &TileParams) -> Result<TileData, GenerationError> {
        self(params)
    }
}

/// Fractal value-noise heightfield over the tile's x/y plane.
///
/// Reads `amplitude`, `frequency` and `octaves` from the generation config,
/// falling back to the generator's own defaults. Output depends only on the
/// parameters, so the same request always yields the same tile.
#[derive(Debug, Clone)]
pub struct HeightfieldGenerator {
    pub amplitude: f64,
    pub frequency: f64,
    pub octaves: u32,
}

impl Default for HeightfieldGenerator {
    fn default() -> Self {
        Self {
            amplitude: 100.0,
            frequency: 0.002,
            octaves: 4,
        }
    }
}

impl HeightfieldGenerator {
    fn lattice(seed: u64, x: i64, y: i64) -> f64 {
        (SplitMix64::hash3(seed, x, y, 0) >> 11) as f64 / (1u64 << 53) as f64
    }

    fn value_noise(seed: u64, x: f64, y: f64) -> f64 {
        let (x0, y0) = (x.floor(), y.floor());
        let (tx, ty) = (smooth(x - x0), smooth(y - y0));
        let (ix, iy) = (x0 as i64, y0 as i64);
        let a = Self::lattice(seed, ix, iy);
        let b = Self::lattice(seed, ix + 1, iy);
        let c = Self::lattice(seed, ix, iy + 1);
        let d = Self::lattice(seed, ix + 1, iy + 1);
        let top = a + (b - a) * tx;
        let bottom = c + (d - c) * tx;
        top + (bottom - top) * ty
    }

    fn height_at(&self, seed: u64, x: f64, y: f64, shape: (f64, f64, u32)) -> f32 {
        let (mut amp, mut freq, octaves) = shape;
        let mut total = 0.0;
        for octave in 0..octaves {
            let n = Self::value_noise(seed.wrapping_add(octave as u64), x * freq, y * freq);
            total += (n * 2.0 - 1.0) * amp;
            amp *= 0.5;
            freq *= 2.0;
        }
        total as f32
    }
}

fn smooth(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

impl TileGenerator for HeightfieldGenerator {
    fn generate(&self, params: &TileParams) -> Result<TileData, GenerationError> {
        if params.resolution < 2 {
            return Err(GenerationError::InvalidParams(format!(
                "resolution must be at least 2, got {}",
                params.resolution
            )));
        }
        if !(params.size > 0.0) || !params.position.is_finite() {
            return Err(GenerationError::InvalidParams(format!(
                "tile size {} at {:?} is not usable",
                params.size, params.position
            )));
        }
        let config = &params.config;
        let amplitude = config.param("amplitude").unwrap_or(self.amplitude);
        let frequency = config.param("frequency").unwrap_or(self.frequency);
        let octaves = config
            .param("octaves")
            .map(|o| o.max(1.0) as u32)
            .unwrap_or(self.octaves);

        let res = params.resolution;
        let step = params.size as f64 / (res - 1) as f64;
        let origin = params.position.as_dvec3();
        let heights: Vec<f32> = (0..res * res)
            .map(|i| {
                let x = origin.x + (i % res) as f64 * step;
                let y = origin.y + (i / res) as f64 * step;
                self.height_at(config.seed, x, y, (amplitude, frequency, octaves))
            })
            .collect();

        Ok(TileData {
            position: params.position,
            size: params.size,
            lod: params.lod,
            resolution: res,
            heights: heights.into(),
        })
    }
}
