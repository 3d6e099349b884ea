use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StreamError;

/// Tuning values for one streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Main-thread time allowed per `update` for absorbing finished tiles.
    pub max_frame_time_ms: f32,
    /// Maximum number of finished tiles absorbed per `update`.
    pub max_tiles_per_frame: usize,
    /// Tile cache capacity in entries. Zero disables caching.
    pub max_cache_size: usize,
    /// Generate on background workers. When false, tiles are generated on
    /// the calling thread inside `update`, under the same budgets.
    pub use_background_thread: bool,
    pub worker_thread_count: usize,
    /// Ceiling on requests submitted but not yet absorbed.
    pub max_pending_requests: usize,
    /// Number of samples kept for the rolling average load time.
    pub load_time_window: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_frame_time_ms: 2.0,
            max_tiles_per_frame: 4,
            max_cache_size: 256,
            use_background_thread: true,
            worker_thread_count: 2,
            max_pending_requests: 128,
            load_time_window: 60,
        }
    }
}

impl StreamingConfig {
    /// Config that generates inline on the calling thread.
    pub fn synchronous() -> Self {
        Self {
            use_background_thread: false,
            ..Self::default()
        }
    }

    pub fn max_frame_time(&self) -> Duration {
        Duration::from_micros((self.max_frame_time_ms.max(0.0) * 1000.0).round() as u64)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.max_frame_time_ms.is_finite() || self.max_frame_time_ms < 0.0 {
            return Err(StreamError::InvalidConfig(format!(
                "max_frame_time_ms must be a non-negative number, got {}",
                self.max_frame_time_ms
            )));
        }
        if self.max_tiles_per_frame == 0 {
            return Err(StreamError::InvalidConfig(
                "max_tiles_per_frame must be at least 1".into(),
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(StreamError::InvalidConfig(
                "max_pending_requests must be at least 1".into(),
            ));
        }
        if self.load_time_window == 0 {
            return Err(StreamError::InvalidConfig(
                "load_time_window must be at least 1".into(),
            ));
        }
        if self.use_background_thread && self.worker_thread_count == 0 {
            return Err(StreamError::InvalidConfig(
                "worker_thread_count must be at least 1 with background threads".into(),
            ));
        }
        Ok(())
    }
}
