use glam::Vec3;
use orrery_common::RequestId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

/// Dispatch priority. Higher variants are handed to workers first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TilePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Opaque generation parameters, forwarded to the generator untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub seed: u64,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl GenerationConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }
}

/// Everything a generator needs to build one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileParams {
    /// Tile origin (minimum corner) in world space.
    pub position: Vec3,
    /// Edge length of the tile in world units.
    pub size: f32,
    pub lod: u32,
    /// Samples per edge.
    pub resolution: u32,
    pub config: GenerationConfig,
}

/// A caller's description of a tile it wants loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub params: TileParams,
    pub priority: TilePriority,
}

impl TileRequest {
    pub fn new(position: Vec3, size: f32, lod: u32, resolution: u32) -> Self {
        Self {
            params: TileParams {
                position,
                size,
                lod,
                resolution,
                config: GenerationConfig::default(),
            },
            priority: TilePriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: TilePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.params.config = config;
        self
    }
}

/// One accepted job sitting in (or taken from) the pending queue.
///
/// Ordering is dispatch order for a max-heap: higher priority first, then the
/// tile closest to the viewer, then the oldest request.
#[derive(Debug, Clone)]
pub struct TileLoadRequest {
    pub id: RequestId,
    pub params: TileParams,
    pub priority: TilePriority,
    pub distance_from_viewer: f32,
    pub submitted_at: Instant,
}

impl Ord for TileLoadRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.distance_from_viewer.total_cmp(&self.distance_from_viewer))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TileLoadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TileLoadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TileLoadRequest {}

/// Where a request is in its lifecycle, as seen from the owning thread.
///
/// `Pending` covers both "queued" and "running on a worker"; the owner only
/// learns a job started when its result arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    Completed,
    Failed,
    /// Canceled while a worker was already running it; the result will be
    /// dropped when it arrives.
    Canceled,
}
