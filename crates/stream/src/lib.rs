//! Streaming: asynchronous terrain tile generation with caching and budgets.
//!
//! # Invariants
//! - Only the thread that owns the [`TerrainStreamer`] touches the tile cache
//!   and the active-request table. Workers see the pending queue and the
//!   completed channel, nothing else.
//! - Outstanding requests never exceed `max_pending_requests`.
//! - One call to [`TerrainStreamer::process_completed_requests`] absorbs at
//!   most `max_tiles_per_frame` results and stops once its time budget is spent.
//! - Cancellation is advisory: a job already running finishes and its result
//!   is dropped on arrival.

mod budget;
mod cache;
mod config;
mod error;
mod generator;
mod manager;
mod queue;
mod request;
mod worker;

pub use budget::{LoadTimeWindow, StreamingStats};
pub use cache::{TileCache, TileCacheEntry, TileKey};
pub use config::StreamingConfig;
pub use error::StreamError;
pub use generator::{GenerationError, HeightfieldGenerator, TileData, TileGenerator};
pub use manager::{TerrainStreamer, TileReadyEvent};
pub use request::{
    GenerationConfig, RequestState, TileLoadRequest, TileParams, TilePriority, TileRequest,
};

pub fn crate_info() -> &'static str {
    "orrery-stream v0.1.0"
}
