use std::time::Duration;

/// Snapshot of streaming health for profiling overlays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingStats {
    /// Requests submitted but not yet absorbed (queued or running).
    pub pending_requests: usize,
    /// Entries in the active-request table, including finished unclaimed ones.
    pub active_requests: usize,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub canceled_requests: u64,
    /// Requests refused by backpressure.
    pub rejected_requests: u64,
    pub cached_tiles: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Rolling average generation time over the configured sample window.
    pub average_load_time: Duration,
    /// Main-thread time spent in the last absorb pass.
    pub last_frame_time: Duration,
    pub tiles_loaded_this_frame: usize,
}

impl StreamingStats {
    /// Fraction of cache lookups that hit, 0.0 when nothing was looked up.
    pub fn cache_hit_rate(&self) -> f32 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f32 / total as f32
        }
    }
}

/// Fixed-size ring of recent tile load times.
#[derive(Debug, Clone)]
pub struct LoadTimeWindow {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl LoadTimeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.history[self.index] = sample;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn samples(&self) -> &[Duration] {
        if self.filled {
            &self.history
        } else {
            &self.history[..self.index]
        }
    }

    pub fn average(&self) -> Duration {
        let samples = self.samples();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.samples().len()
    }

    pub fn clear(&mut self) {
        self.index = 0;
        self.filled = false;
    }
}
