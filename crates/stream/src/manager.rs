use crossbeam_channel::{Receiver, Sender};
use glam::Vec3;
use orrery_common::RequestId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::budget::{LoadTimeWindow, StreamingStats};
use crate::cache::{TileCache, TileKey};
use crate::config::StreamingConfig;
use crate::error::StreamError;
use crate::generator::{GenerationError, TileData, TileGenerator};
use crate::queue::PendingQueue;
use crate::request::{RequestState, TileLoadRequest, TilePriority, TileRequest};
use crate::worker::{TileLoadResult, WorkerPool, run_job};

/// Notification sent to subscribers when a request's result is absorbed.
#[derive(Debug, Clone, PartialEq)]
pub struct TileReadyEvent {
    pub id: RequestId,
    pub key: TileKey,
    /// False when generation failed; the error is reported by
    /// [`TerrainStreamer::get_loaded_tile`].
    pub succeeded: bool,
}

#[derive(Debug)]
struct ActiveRequest {
    key: TileKey,
    priority: TilePriority,
    state: RequestState,
    tile: Option<TileData>,
    error: Option<GenerationError>,
    submitted_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    canceled: u64,
    rejected: u64,
    cache_hits: u64,
    cache_misses: u64,
    last_frame_time: Duration,
    tiles_this_frame: usize,
}

/// Streams terrain tiles from a generator through a background worker pool.
///
/// The owning thread submits requests, calls [`TerrainStreamer::update`] once
/// per frame and polls for results. Workers only ever see the pending queue
/// and the completed channel; the cache and the active-request table are
/// touched exclusively by the owner, which is why they need no locks.
pub struct TerrainStreamer<G: TileGenerator> {
    generator: Arc<G>,
    config: StreamingConfig,
    initialized: bool,
    pending: Arc<PendingQueue>,
    completed_tx: Sender<TileLoadResult>,
    completed_rx: Receiver<TileLoadResult>,
    workers: Option<WorkerPool>,
    active: HashMap<RequestId, ActiveRequest>,
    next_id: RequestId,
    /// Submitted but not yet absorbed. Bounded by `max_pending_requests`.
    outstanding: usize,
    cache: TileCache,
    load_times: LoadTimeWindow,
    counters: Counters,
    subscribers: Vec<Sender<TileReadyEvent>>,
}

impl<G: TileGenerator> TerrainStreamer<G> {
    /// Create a streamer that still needs [`TerrainStreamer::initialize`].
    pub fn new(generator: G) -> Self {
        let config = StreamingConfig::default();
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        Self {
            generator: Arc::new(generator),
            cache: TileCache::new(config.max_cache_size),
            load_times: LoadTimeWindow::new(config.load_time_window),
            config,
            initialized: false,
            pending: Arc::new(PendingQueue::new()),
            completed_tx,
            completed_rx,
            workers: None,
            active: HashMap::new(),
            next_id: RequestId::FIRST,
            outstanding: 0,
            counters: Counters::default(),
            subscribers: Vec::new(),
        }
    }

    /// Create and initialize in one step.
    pub fn with_config(generator: G, config: StreamingConfig) -> Result<Self, StreamError> {
        let mut streamer = Self::new(generator);
        streamer.initialize(config)?;
        Ok(streamer)
    }

    /// Apply `config` and start workers if background threads are enabled.
    ///
    /// Calling this on a running streamer shuts it down first; cached tiles
    /// survive, trimmed to the new cache size.
    pub fn initialize(&mut self, config: StreamingConfig) -> Result<(), StreamError> {
        config.validate()?;
        if self.initialized {
            self.shutdown();
        }
        self.cache.set_max_size(config.max_cache_size);
        self.load_times = LoadTimeWindow::new(config.load_time_window);
        if config.use_background_thread {
            let pool = WorkerPool::spawn(
                config.worker_thread_count,
                Arc::clone(&self.generator),
                Arc::clone(&self.pending),
                self.completed_tx.clone(),
            )?;
            self.workers = Some(pool);
        }
        tracing::info!(
            background = config.use_background_thread,
            workers = self.worker_count(),
            cache = config.max_cache_size,
            max_pending = config.max_pending_requests,
            "terrain streamer initialized"
        );
        self.config = config;
        self.initialized = true;
        Ok(())
    }

    /// Stop and join all workers, then drop every queued, running and
    /// unclaimed request. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.workers.take() {
            pool.shutdown();
        }
        let dropped = self.pending.drain().len();
        let mut discarded = 0;
        while self.completed_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if self.initialized {
            tracing::info!(
                dropped_pending = dropped,
                discarded_results = discarded,
                unclaimed = self.active.len(),
                "terrain streamer shut down"
            );
        }
        self.active.clear();
        self.outstanding = 0;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerPool::len)
    }

    /// Submit a tile for loading and return the id used for all later calls.
    ///
    /// A tile already in the cache completes immediately. Otherwise the
    /// request is queued unless `max_pending_requests` are already
    /// outstanding, in which case it is refused with
    /// [`StreamError::Backpressure`] and the caller should retry later.
    ///
    /// Cache hits take no backpressure slot, but each one stays in the
    /// active table until it is claimed with
    /// [`TerrainStreamer::get_loaded_tile`] or dropped with
    /// [`TerrainStreamer::cancel_request`]. Callers that stop caring about a
    /// result must do one of the two, or the table grows without bound.
    pub fn request_tile_load(
        &mut self,
        request: TileRequest,
        viewer_position: Vec3,
    ) -> Result<RequestId, StreamError> {
        if !self.initialized {
            return Err(StreamError::NotInitialized);
        }
        let TileRequest { params, priority } = request;
        let key = TileKey::new(params.position, params.lod);

        if let Some(tile) = self.cache.get(&key) {
            self.counters.cache_hits += 1;
            let id = self.allocate_id();
            self.active.insert(
                id,
                ActiveRequest {
                    key,
                    priority,
                    state: RequestState::Completed,
                    tile: Some(tile),
                    error: None,
                    submitted_at: Instant::now(),
                },
            );
            tracing::trace!(%id, "tile request served from cache");
            self.notify(TileReadyEvent {
                id,
                key,
                succeeded: true,
            });
            return Ok(id);
        }
        self.counters.cache_misses += 1;

        let limit = self.config.max_pending_requests;
        if self.outstanding >= limit {
            self.counters.rejected += 1;
            tracing::warn!(
                outstanding = self.outstanding,
                limit,
                "tile request rejected by backpressure"
            );
            return Err(StreamError::Backpressure {
                outstanding: self.outstanding,
                limit,
            });
        }

        let id = self.allocate_id();
        let submitted_at = Instant::now();
        let distance_from_viewer = params.position.distance(viewer_position);
        self.active.insert(
            id,
            ActiveRequest {
                key,
                priority,
                state: RequestState::Pending,
                tile: None,
                error: None,
                submitted_at,
            },
        );
        self.outstanding += 1;
        self.pending.push(TileLoadRequest {
            id,
            params,
            priority,
            distance_from_viewer,
            submitted_at,
        });
        tracing::debug!(%id, ?priority, distance = distance_from_viewer, "tile request queued");
        Ok(id)
    }

    /// True once a result (tile or error) is waiting to be claimed.
    pub fn is_tile_ready(&self, id: RequestId) -> bool {
        self.active
            .get(&id)
            .is_some_and(|r| matches!(r.state, RequestState::Completed | RequestState::Failed))
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.active.get(&id).map(|r| r.state)
    }

    /// Claim a finished tile, removing the request's bookkeeping.
    ///
    /// A failed generation is claimed too and reported as
    /// [`StreamError::GenerationFailed`]. Requests that are still pending stay
    /// untouched and report [`StreamError::NotReady`].
    pub fn get_loaded_tile(&mut self, id: RequestId) -> Result<TileData, StreamError> {
        let state = self
            .active
            .get(&id)
            .map(|r| r.state)
            .ok_or(StreamError::UnknownRequest(id))?;
        match state {
            RequestState::Pending => Err(StreamError::NotReady(id)),
            RequestState::Canceled => Err(StreamError::Canceled(id)),
            RequestState::Completed | RequestState::Failed => {
                let entry = self
                    .active
                    .remove(&id)
                    .ok_or(StreamError::UnknownRequest(id))?;
                match (entry.tile, entry.error) {
                    (Some(tile), _) => Ok(tile),
                    (None, Some(source)) => Err(StreamError::GenerationFailed { id, source }),
                    (None, None) => Err(StreamError::GenerationFailed {
                        id,
                        source: GenerationError::Failed("result carried no tile".into()),
                    }),
                }
            }
        }
    }

    /// Best-effort cancellation. A queued request is dropped outright; one a
    /// worker is already running is marked and its result discarded when it
    /// arrives; a finished unclaimed result is dropped. False for unknown or
    /// already-canceled ids.
    pub fn cancel_request(&mut self, id: RequestId) -> bool {
        let Some(state) = self.active.get(&id).map(|r| r.state) else {
            return false;
        };
        match state {
            RequestState::Canceled => return false,
            RequestState::Pending => {
                if self.pending.remove(id) {
                    self.active.remove(&id);
                    self.outstanding = self.outstanding.saturating_sub(1);
                } else if let Some(entry) = self.active.get_mut(&id) {
                    entry.state = RequestState::Canceled;
                }
            }
            RequestState::Completed | RequestState::Failed => {
                self.active.remove(&id);
            }
        }
        self.counters.canceled += 1;
        tracing::debug!(%id, "tile request canceled");
        true
    }

    /// Per-frame entry point: absorb finished tiles within the configured budget.
    pub fn update(&mut self, delta: Duration) -> usize {
        let _span = tracing::info_span!("stream_update", dt = ?delta).entered();
        self.process_completed_requests(self.config.max_frame_time())
    }

    /// Absorb finished results in arrival order, stopping after
    /// `max_tiles_per_frame` results or once `max_time` has elapsed.
    ///
    /// Without background workers, queued jobs are generated here under the
    /// same budget. Returns the number of results absorbed, including results
    /// of canceled requests that were discarded.
    pub fn process_completed_requests(&mut self, max_time: Duration) -> usize {
        if !self.initialized {
            return 0;
        }
        let start = Instant::now();
        let max_tiles = self.config.max_tiles_per_frame;
        let mut processed = 0;
        while processed < max_tiles && start.elapsed() < max_time {
            let result = match self.completed_rx.try_recv() {
                Ok(result) => result,
                Err(_) if self.workers.is_none() => match self.pending.pop() {
                    Some(request) => run_job(&*self.generator, request),
                    None => break,
                },
                Err(_) => break,
            };
            self.absorb(result);
            processed += 1;
        }
        self.counters.last_frame_time = start.elapsed();
        self.counters.tiles_this_frame = processed;
        if processed > 0 {
            tracing::trace!(
                processed,
                elapsed = ?self.counters.last_frame_time,
                outstanding = self.outstanding,
                "absorbed tile results"
            );
        }
        processed
    }

    fn absorb(&mut self, result: TileLoadResult) {
        let TileLoadResult {
            id,
            key,
            outcome,
            load_time,
        } = result;
        let Some(entry) = self.active.get_mut(&id) else {
            tracing::trace!(%id, "result for unknown request dropped");
            return;
        };
        self.outstanding = self.outstanding.saturating_sub(1);
        self.load_times.record(load_time);

        if entry.state == RequestState::Canceled {
            self.active.remove(&id);
            tracing::trace!(%id, "result for canceled request discarded");
            return;
        }

        let succeeded = match outcome {
            Ok(tile) => {
                let evicted = self.cache.insert(key, tile.clone());
                entry.tile = Some(tile);
                entry.state = RequestState::Completed;
                self.counters.completed += 1;
                tracing::debug!(
                    %id,
                    priority = ?entry.priority,
                    latency = ?entry.submitted_at.elapsed(),
                    evicted = evicted.len(),
                    "tile ready"
                );
                true
            }
            Err(error) => {
                tracing::warn!(%id, %error, "tile generation failed");
                entry.error = Some(error);
                entry.state = RequestState::Failed;
                self.counters.failed += 1;
                false
            }
        };
        debug_assert_eq!(entry.key, key, "result key does not match request");
        self.notify(TileReadyEvent { id, key, succeeded });
    }

    /// Receive a [`TileReadyEvent`] for every result absorbed from now on.
    pub fn subscribe(&mut self) -> Receiver<TileReadyEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: TileReadyEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    /// Requests submitted but not yet absorbed.
    pub fn outstanding_requests(&self) -> usize {
        self.outstanding
    }

    pub fn is_tile_cached(&self, position: Vec3, lod: u32) -> bool {
        self.cache.contains(&TileKey::new(position, lod))
    }

    /// Fetch from the cache, marking the tile most recently used.
    pub fn get_cached_tile(&mut self, position: Vec3, lod: u32) -> Option<TileData> {
        let tile = self.cache.get(&TileKey::new(position, lod));
        if tile.is_some() {
            self.counters.cache_hits += 1;
        } else {
            self.counters.cache_misses += 1;
        }
        tile
    }

    /// Insert a tile produced elsewhere, evicting LRU entries if full.
    pub fn add_to_cache(&mut self, position: Vec3, lod: u32, tile: TileData) {
        self.cache.insert(TileKey::new(position, lod), tile);
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Evict the `count` least recently used tiles. Returns how many went.
    pub fn evict_lru_tiles(&mut self, count: usize) -> usize {
        self.cache.evict_lru(count).len()
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            pending_requests: self.outstanding,
            active_requests: self.active.len(),
            completed_requests: self.counters.completed,
            failed_requests: self.counters.failed,
            canceled_requests: self.counters.canceled,
            rejected_requests: self.counters.rejected,
            cached_tiles: self.cache.len(),
            cache_hits: self.counters.cache_hits,
            cache_misses: self.counters.cache_misses,
            average_load_time: self.load_times.average(),
            last_frame_time: self.counters.last_frame_time,
            tiles_loaded_this_frame: self.counters.tiles_this_frame,
        }
    }

    /// Zero counters and the load-time window. Live state is kept.
    pub fn reset_stats(&mut self) {
        self.counters = Counters::default();
        self.load_times.clear();
    }
}

impl<G: TileGenerator> Drop for TerrainStreamer<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<G: TileGenerator> std::fmt::Debug for TerrainStreamer<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerrainStreamer")
            .field("initialized", &self.initialized)
            .field("workers", &self.worker_count())
            .field("outstanding", &self.outstanding)
            .field("active", &self.active.len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::HeightfieldGenerator;
    use crate::request::TileParams;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    fn flat(p: &TileParams) -> Result<TileData, GenerationError> {
        Ok(TileData {
            position: p.position,
            size: p.size,
            lod: p.lod,
            resolution: p.resolution,
            heights: vec![p.position.x; (p.resolution * p.resolution) as usize].into(),
        })
    }

    fn sync_config() -> StreamingConfig {
        StreamingConfig {
            max_frame_time_ms: 1000.0,
            max_tiles_per_frame: 64,
            ..StreamingConfig::synchronous()
        }
    }

    fn threaded_config(workers: usize) -> StreamingConfig {
        StreamingConfig {
            max_frame_time_ms: 1000.0,
            max_tiles_per_frame: 64,
            worker_thread_count: workers,
            ..StreamingConfig::default()
        }
    }

    fn tile_at(x: f32) -> TileRequest {
        TileRequest::new(Vec3::new(x, 0.0, 0.0), 1000.0, 0, 4)
    }

    fn pump_until<G: TileGenerator>(streamer: &mut TerrainStreamer<G>, ids: &[RequestId]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !ids.iter().all(|id| streamer.is_tile_ready(*id)) {
            assert!(Instant::now() < deadline, "timed out waiting for tiles");
            streamer.update(Duration::from_millis(16));
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn requests_fail_before_initialize() {
        let mut streamer = TerrainStreamer::new(flat);
        assert!(matches!(
            streamer.request_tile_load(tile_at(0.0), Vec3::ZERO),
            Err(StreamError::NotInitialized)
        ));
        assert_eq!(streamer.update(Duration::ZERO), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StreamingConfig {
            max_pending_requests: 0,
            ..sync_config()
        };
        assert!(TerrainStreamer::with_config(flat, config).is_err());
    }

    #[test]
    fn synchronous_round_trip() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        assert_eq!(streamer.worker_count(), 0);
        let id = streamer.request_tile_load(tile_at(5.0), Vec3::ZERO).unwrap();
        assert!(!streamer.is_tile_ready(id));
        assert!(matches!(streamer.get_loaded_tile(id), Err(StreamError::NotReady(_))));

        assert_eq!(streamer.update(Duration::from_millis(16)), 1);
        assert!(streamer.is_tile_ready(id));
        let tile = streamer.get_loaded_tile(id).unwrap();
        assert_eq!(tile.heights[0], 5.0);
        assert!(streamer.is_tile_cached(Vec3::new(5.0, 0.0, 0.0), 0));

        // Claimed results are gone.
        assert!(!streamer.is_tile_ready(id));
        assert!(matches!(streamer.get_loaded_tile(id), Err(StreamError::UnknownRequest(_))));
    }

    #[test]
    fn request_ids_increase() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let a = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        let b = streamer.request_tile_load(tile_at(2.0), Vec3::ZERO).unwrap();
        assert!(b > a);
    }

    #[test]
    fn critical_dispatched_before_low_synchronously() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let generator = {
            let order = Arc::clone(&order);
            move |p: &TileParams| {
                order.lock().push(p.position);
                flat(p)
            }
        };
        let mut streamer = TerrainStreamer::with_config(generator, sync_config()).unwrap();
        let low = TileRequest::new(Vec3::new(5000.0, 5000.0, 0.0), 1000.0, 0, 4)
            .with_priority(TilePriority::Low);
        let critical =
            TileRequest::new(Vec3::ZERO, 1000.0, 0, 4).with_priority(TilePriority::Critical);
        let low_id = streamer.request_tile_load(low, Vec3::ZERO).unwrap();
        let critical_id = streamer.request_tile_load(critical, Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));

        assert_eq!(*order.lock(), vec![Vec3::ZERO, Vec3::new(5000.0, 5000.0, 0.0)]);
        assert!(streamer.is_tile_ready(low_id) && streamer.is_tile_ready(critical_id));
    }

    #[test]
    fn closer_tile_wins_priority_tie() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let generator = {
            let order = Arc::clone(&order);
            move |p: &TileParams| {
                order.lock().push(p.position.x);
                flat(p)
            }
        };
        let mut streamer = TerrainStreamer::with_config(generator, sync_config()).unwrap();
        let viewer = Vec3::new(100.0, 0.0, 0.0);
        for x in [900.0, 150.0, 400.0] {
            streamer.request_tile_load(tile_at(x), viewer).unwrap();
        }
        streamer.update(Duration::from_millis(16));
        assert_eq!(*order.lock(), vec![150.0, 400.0, 900.0]);
    }

    #[test]
    fn single_worker_dispatches_critical_first() {
        let (started_tx, started_rx) = unbounded::<f32>();
        let (permit_tx, permit_rx) = unbounded::<()>();
        let generator = move |p: &TileParams| {
            started_tx.send(p.position.x).ok();
            permit_rx.recv_timeout(Duration::from_secs(10)).ok();
            flat(p)
        };
        let mut streamer = TerrainStreamer::with_config(generator, threaded_config(1)).unwrap();

        // Occupy the only worker so the next two requests queue up together.
        let blocker = streamer.request_tile_load(tile_at(-1.0), Vec3::ZERO).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(10)), Ok(-1.0));

        let low = TileRequest::new(Vec3::new(5000.0, 5000.0, 0.0), 1000.0, 0, 4)
            .with_priority(TilePriority::Low);
        let critical =
            TileRequest::new(Vec3::ZERO, 1000.0, 0, 4).with_priority(TilePriority::Critical);
        let low_id = streamer.request_tile_load(low, Vec3::ZERO).unwrap();
        let critical_id = streamer.request_tile_load(critical, Vec3::ZERO).unwrap();

        for _ in 0..3 {
            permit_tx.send(()).unwrap();
        }
        pump_until(&mut streamer, &[blocker, low_id, critical_id]);

        let dispatched: Vec<f32> = started_rx.try_iter().collect();
        assert_eq!(dispatched, vec![0.0, 5000.0]);
    }

    #[test]
    fn backpressure_rejects_until_absorbed() {
        let config = StreamingConfig {
            max_pending_requests: 1,
            ..sync_config()
        };
        let mut streamer = TerrainStreamer::with_config(flat, config).unwrap();
        let first = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        let second = streamer.request_tile_load(tile_at(2.0), Vec3::ZERO);
        assert!(matches!(
            second,
            Err(StreamError::Backpressure { outstanding: 1, limit: 1 })
        ));
        assert_eq!(streamer.stats().rejected_requests, 1);

        streamer.update(Duration::from_millis(16));
        assert!(streamer.is_tile_ready(first));
        assert!(streamer.request_tile_load(tile_at(2.0), Vec3::ZERO).is_ok());
    }

    #[test]
    fn backpressure_with_stalled_workers() {
        let (permit_tx, permit_rx) = unbounded::<()>();
        let generator = move |p: &TileParams| {
            permit_rx.recv_timeout(Duration::from_secs(10)).ok();
            flat(p)
        };
        let config = StreamingConfig {
            max_pending_requests: 2,
            ..threaded_config(1)
        };
        let mut streamer = TerrainStreamer::with_config(generator, config).unwrap();
        let a = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        let b = streamer.request_tile_load(tile_at(2.0), Vec3::ZERO).unwrap();
        assert!(streamer.request_tile_load(tile_at(3.0), Vec3::ZERO).is_err());

        permit_tx.send(()).unwrap();
        permit_tx.send(()).unwrap();
        pump_until(&mut streamer, &[a, b]);
        assert!(streamer.request_tile_load(tile_at(3.0), Vec3::ZERO).is_ok());
        permit_tx.send(()).unwrap();
    }

    #[test]
    fn frame_budget_caps_tiles_per_call() {
        let config = StreamingConfig {
            max_tiles_per_frame: 3,
            ..sync_config()
        };
        let mut streamer = TerrainStreamer::with_config(flat, config).unwrap();
        for i in 0..10 {
            streamer.request_tile_load(tile_at(i as f32), Vec3::ZERO).unwrap();
        }
        let per_frame: Vec<usize> = (0..5)
            .map(|_| streamer.process_completed_requests(Duration::from_secs(10)))
            .collect();
        assert_eq!(per_frame, vec![3, 3, 3, 1, 0]);
        assert_eq!(streamer.stats().tiles_loaded_this_frame, 0);
        assert_eq!(streamer.stats().completed_requests, 10);
    }

    #[test]
    fn zero_time_budget_absorbs_nothing() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        assert_eq!(streamer.process_completed_requests(Duration::ZERO), 0);
        assert!(!streamer.is_tile_ready(id));
    }

    #[test]
    fn time_budget_stops_slow_frames() {
        let slow = |p: &TileParams| {
            std::thread::sleep(Duration::from_millis(20));
            flat(p)
        };
        let mut streamer = TerrainStreamer::with_config(slow, sync_config()).unwrap();
        for i in 0..5 {
            streamer.request_tile_load(tile_at(i as f32), Vec3::ZERO).unwrap();
        }
        // Budget runs out after the first job; overshoot is one job.
        assert_eq!(streamer.process_completed_requests(Duration::from_millis(5)), 1);
    }

    #[test]
    fn threaded_results_match_synchronous() {
        let generator = HeightfieldGenerator::default();
        let mut sync = TerrainStreamer::with_config(generator.clone(), sync_config()).unwrap();
        let mut threaded = TerrainStreamer::with_config(generator, threaded_config(3)).unwrap();
        let mut pairs = Vec::new();
        for i in 0..12 {
            let request = TileRequest::new(Vec3::new(i as f32 * 256.0, 0.0, 0.0), 256.0, 0, 9);
            let a = sync.request_tile_load(request.clone(), Vec3::ZERO).unwrap();
            let b = threaded.request_tile_load(request, Vec3::ZERO).unwrap();
            pairs.push((a, b));
        }
        let (sync_ids, threaded_ids): (Vec<_>, Vec<_>) = pairs.iter().copied().unzip();
        pump_until(&mut sync, &sync_ids);
        pump_until(&mut threaded, &threaded_ids);
        for (a, b) in pairs {
            assert_eq!(sync.get_loaded_tile(a).unwrap(), threaded.get_loaded_tile(b).unwrap());
        }
    }

    #[test]
    fn generation_failure_is_reported_not_defaulted() {
        let failing = |_: &TileParams| -> Result<TileData, GenerationError> {
            Err(GenerationError::Failed("no terrain here".into()))
        };
        let mut streamer = TerrainStreamer::with_config(failing, sync_config()).unwrap();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));

        assert!(streamer.is_tile_ready(id));
        assert_eq!(streamer.request_state(id), Some(RequestState::Failed));
        match streamer.get_loaded_tile(id) {
            Err(StreamError::GenerationFailed { id: failed, source }) => {
                assert_eq!(failed, id);
                assert_eq!(source, GenerationError::Failed("no terrain here".into()));
            }
            other => panic!("expected generation failure, got {other:?}"),
        }
        assert!(!streamer.is_tile_cached(Vec3::new(1.0, 0.0, 0.0), 0));
        assert_eq!(streamer.stats().failed_requests, 1);
        assert_eq!(streamer.outstanding_requests(), 0);
    }

    #[test]
    fn panicking_generator_fails_request_and_keeps_worker() {
        let generator = |p: &TileParams| {
            if p.position.x < 0.0 {
                panic!("negative tile");
            }
            flat(p)
        };
        let mut streamer = TerrainStreamer::with_config(generator, threaded_config(1)).unwrap();
        let bad = streamer.request_tile_load(tile_at(-1.0), Vec3::ZERO).unwrap();
        let good = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        pump_until(&mut streamer, &[bad, good]);
        assert!(matches!(
            streamer.get_loaded_tile(bad),
            Err(StreamError::GenerationFailed { .. })
        ));
        assert!(streamer.get_loaded_tile(good).is_ok());
    }

    #[test]
    fn cancel_pending_drops_request() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        assert!(streamer.cancel_request(id));
        assert!(!streamer.cancel_request(id));
        assert_eq!(streamer.outstanding_requests(), 0);
        assert_eq!(streamer.update(Duration::from_millis(16)), 0);
        assert!(!streamer.is_tile_ready(id));
        assert!(matches!(streamer.get_loaded_tile(id), Err(StreamError::UnknownRequest(_))));
        assert!(!streamer.is_tile_cached(Vec3::new(1.0, 0.0, 0.0), 0));
    }

    #[test]
    fn cancel_in_flight_discards_result() {
        let (started_tx, started_rx) = unbounded::<()>();
        let (permit_tx, permit_rx) = unbounded::<()>();
        let generator = move |p: &TileParams| {
            started_tx.send(()).ok();
            permit_rx.recv_timeout(Duration::from_secs(10)).ok();
            flat(p)
        };
        let mut streamer = TerrainStreamer::with_config(generator, threaded_config(1)).unwrap();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert!(streamer.cancel_request(id));
        assert_eq!(streamer.request_state(id), Some(RequestState::Canceled));
        assert!(matches!(streamer.get_loaded_tile(id), Err(StreamError::Canceled(_))));
        // Still running, so it still counts against backpressure.
        assert_eq!(streamer.outstanding_requests(), 1);

        permit_tx.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while streamer.request_state(id).is_some() {
            assert!(Instant::now() < deadline, "canceled result never arrived");
            streamer.update(Duration::from_millis(16));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(streamer.outstanding_requests(), 0);
        assert!(!streamer.is_tile_cached(Vec3::new(1.0, 0.0, 0.0), 0));
        assert_eq!(streamer.stats().completed_requests, 0);
    }

    #[test]
    fn cancel_unclaimed_result_drops_it() {
        let failing = |p: &TileParams| -> Result<TileData, GenerationError> {
            if p.position.x < 0.0 {
                Err(GenerationError::Failed("hole".into()))
            } else {
                flat(p)
            }
        };
        let mut streamer = TerrainStreamer::with_config(failing, sync_config()).unwrap();
        let done = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        let failed = streamer.request_tile_load(tile_at(-1.0), Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));
        assert_eq!(streamer.request_state(done), Some(RequestState::Completed));
        assert_eq!(streamer.request_state(failed), Some(RequestState::Failed));

        assert!(streamer.cancel_request(done));
        assert!(streamer.cancel_request(failed));
        for id in [done, failed] {
            assert!(matches!(
                streamer.get_loaded_tile(id),
                Err(StreamError::UnknownRequest(_))
            ));
        }
        let stats = streamer.stats();
        assert_eq!(stats.canceled_requests, 2);
        assert_eq!(stats.active_requests, 0);
        // The finished tile stays cached.
        assert!(streamer.is_tile_cached(Vec3::new(1.0, 0.0, 0.0), 0));
    }

    #[test]
    fn cancel_unknown_is_noop() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        assert!(!streamer.cancel_request(RequestId(999)));
        assert_eq!(streamer.stats().canceled_requests, 0);
    }

    #[test]
    fn cached_tile_short_circuits_request() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let first = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));
        streamer.get_loaded_tile(first).unwrap();

        let again = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        assert!(streamer.is_tile_ready(again));
        assert_eq!(streamer.outstanding_requests(), 0);
        assert_eq!(streamer.stats().cache_hits, 1);
        assert!(streamer.get_loaded_tile(again).is_ok());
    }

    #[test]
    fn cache_api_is_lru() {
        let config = StreamingConfig {
            max_cache_size: 2,
            ..sync_config()
        };
        let mut streamer = TerrainStreamer::with_config(flat, config).unwrap();
        let make = |x: f32| flat(&tile_at(x).params).unwrap();
        let (a, b, c) = (Vec3::X, Vec3::new(2.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0));

        streamer.add_to_cache(a, 0, make(1.0));
        streamer.add_to_cache(b, 0, make(2.0));
        streamer.add_to_cache(c, 0, make(3.0));
        assert!(!streamer.is_tile_cached(a, 0));
        assert!(streamer.is_tile_cached(b, 0) && streamer.is_tile_cached(c, 0));

        // Touch b so c becomes the oldest.
        assert!(streamer.get_cached_tile(b, 0).is_some());
        streamer.add_to_cache(a, 0, make(1.0));
        assert!(streamer.is_tile_cached(b, 0));
        assert!(!streamer.is_tile_cached(c, 0));

        assert!(streamer.get_cached_tile(c, 0).is_none());
        let stats = streamer.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));

        assert_eq!(streamer.evict_lru_tiles(5), 2);
        streamer.add_to_cache(a, 0, make(1.0));
        streamer.clear_cache();
        assert_eq!(streamer.stats().cached_tiles, 0);
    }

    #[test]
    fn lod_is_part_of_cache_key() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let tile = flat(&tile_at(1.0).params).unwrap();
        streamer.add_to_cache(Vec3::X, 0, tile);
        assert!(streamer.is_tile_cached(Vec3::X, 0));
        assert!(!streamer.is_tile_cached(Vec3::X, 1));
    }

    #[test]
    fn subscribers_hear_about_results() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let events = streamer.subscribe();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));
        let event = events.try_recv().unwrap();
        assert_eq!(event.id, id);
        assert!(event.succeeded);
        assert_eq!(event.key, TileKey::new(Vec3::new(1.0, 0.0, 0.0), 0));

        drop(events);
        streamer.request_tile_load(tile_at(2.0), Vec3::ZERO).unwrap();
        streamer.update(Duration::from_millis(16));
        assert!(streamer.subscribers.is_empty());
    }

    #[test]
    fn stats_track_activity_and_reset() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let a = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        streamer.request_tile_load(tile_at(2.0), Vec3::ZERO).unwrap();
        let before = streamer.stats();
        assert_eq!(before.pending_requests, 2);
        assert_eq!(before.active_requests, 2);
        assert_eq!(before.cache_misses, 2);

        streamer.update(Duration::from_millis(16));
        streamer.get_loaded_tile(a).unwrap();
        let after = streamer.stats();
        assert_eq!(after.pending_requests, 0);
        assert_eq!(after.active_requests, 1);
        assert_eq!(after.completed_requests, 2);
        assert_eq!(after.cached_tiles, 2);
        assert_eq!(after.tiles_loaded_this_frame, 2);

        streamer.reset_stats();
        let reset = streamer.stats();
        assert_eq!(reset.completed_requests, 0);
        assert_eq!(reset.average_load_time, Duration::ZERO);
        assert_eq!(reset.cached_tiles, 2);
    }

    #[test]
    fn shutdown_is_idempotent_and_drops_work() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        let id = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        streamer.shutdown();
        streamer.shutdown();
        assert!(!streamer.is_initialized());
        assert!(!streamer.is_tile_ready(id));
        assert_eq!(streamer.outstanding_requests(), 0);

        streamer.initialize(sync_config()).unwrap();
        let next = streamer.request_tile_load(tile_at(1.0), Vec3::ZERO).unwrap();
        assert!(next > id);
    }

    #[test]
    fn threaded_shutdown_joins_workers() {
        let mut streamer = TerrainStreamer::with_config(flat, threaded_config(4)).unwrap();
        assert_eq!(streamer.worker_count(), 4);
        for i in 0..20 {
            streamer.request_tile_load(tile_at(i as f32), Vec3::ZERO).unwrap();
        }
        streamer.shutdown();
        assert_eq!(streamer.worker_count(), 0);
        assert_eq!(streamer.stats().active_requests, 0);
    }

    #[test]
    fn reinitialize_trims_cache() {
        let mut streamer = TerrainStreamer::with_config(flat, sync_config()).unwrap();
        for i in 0..4 {
            let tile = flat(&tile_at(i as f32).params).unwrap();
            streamer.add_to_cache(Vec3::new(i as f32, 0.0, 0.0), 0, tile);
        }
        let config = StreamingConfig {
            max_cache_size: 2,
            ..sync_config()
        };
        streamer.initialize(config).unwrap();
        assert_eq!(streamer.cache().len(), 2);
        assert!(streamer.is_tile_cached(Vec3::new(3.0, 0.0, 0.0), 0));
    }
}
