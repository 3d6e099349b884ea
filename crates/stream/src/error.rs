use orrery_common::RequestId;

use crate::generator::GenerationError;

/// Errors reported by the terrain streamer. None of these are fatal; each
/// describes why one call could not do what was asked.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("streamer not initialized")]
    NotInitialized,
    #[error("invalid streaming config: {0}")]
    InvalidConfig(String),
    #[error("too many outstanding requests: {outstanding} (limit {limit})")]
    Backpressure { outstanding: usize, limit: usize },
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("request {0} is not ready")]
    NotReady(RequestId),
    #[error("request {0} was canceled")]
    Canceled(RequestId),
    #[error("tile generation failed for {id}: {source}")]
    GenerationFailed {
        id: RequestId,
        #[source]
        source: GenerationError,
    },
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
