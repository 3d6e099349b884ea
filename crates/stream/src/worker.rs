use crossbeam_channel::Sender;
use orrery_common::RequestId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::TileKey;
use crate::error::StreamError;
use crate::generator::{GenerationError, TileData, TileGenerator};
use crate::queue::PendingQueue;
use crate::request::TileLoadRequest;

/// How long an idle worker parks before re-checking the shutdown flag.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// A finished job on its way back to the owning thread.
#[derive(Debug)]
pub(crate) struct TileLoadResult {
    pub id: RequestId,
    pub key: TileKey,
    pub outcome: Result<TileData, GenerationError>,
    pub load_time: Duration,
}

/// Run one job to completion. A panicking generator is reported as a
/// generation error instead of taking the worker down with it.
pub(crate) fn run_job<G: TileGenerator>(generator: &G, request: TileLoadRequest) -> TileLoadResult {
    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| generator.generate(&request.params)))
        .unwrap_or_else(|payload| Err(GenerationError::Panicked(panic_message(payload.as_ref()))));
    TileLoadResult {
        id: request.id,
        key: TileKey::new(request.params.position, request.params.lod),
        outcome,
        load_time: start.elapsed(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Fixed pool of generator threads fed by the pending queue.
///
/// Shutdown is cooperative: workers check the flag between jobs, so a job
/// that has started always runs to completion before its thread exits.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<PendingQueue>,
}

impl WorkerPool {
    pub fn spawn<G: TileGenerator>(
        count: usize,
        generator: Arc<G>,
        pending: Arc<PendingQueue>,
        completed: Sender<TileLoadResult>,
    ) -> Result<Self, StreamError> {
        let mut pool = Self {
            handles: Vec::with_capacity(count),
            shutdown: Arc::new(AtomicBool::new(false)),
            pending,
        };
        for index in 0..count {
            let generator = Arc::clone(&generator);
            let pending = Arc::clone(&pool.pending);
            let completed = completed.clone();
            let shutdown = Arc::clone(&pool.shutdown);
            let spawned = std::thread::Builder::new()
                .name(format!("tile-worker-{index}"))
                .spawn(move || worker_loop(index, &*generator, &pending, &completed, &shutdown));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(StreamError::WorkerSpawn(e));
                }
            }
        }
        tracing::debug!(workers = count, "tile worker pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for each to finish its current job.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        self.pending.wake_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("tile worker exited by panic");
            }
        }
        tracing::debug!("tile worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<G: TileGenerator>(
    index: usize,
    generator: &G,
    pending: &PendingQueue,
    completed: &Sender<TileLoadResult>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(request) = pending.pop_timeout(IDLE_WAIT) else {
            continue;
        };
        let id = request.id;
        let result = run_job(generator, request);
        tracing::trace!(worker = index, %id, elapsed = ?result.load_time, "tile generated");
        if completed.send(result).is_err() {
            // Owner is gone; nobody will read further results.
            break;
        }
    }
}
