use orrery_common::RequestId;
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::request::TileLoadRequest;

/// Multi-producer priority queue of jobs waiting for a worker.
///
/// Workers park on the condvar while the queue is empty; every push wakes one.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    heap: Mutex<BinaryHeap<TileLoadRequest>>,
    available: Condvar,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: TileLoadRequest) {
        self.heap.lock().push(request);
        self.available.notify_one();
    }

    /// Take the highest-priority job without waiting.
    pub fn pop(&self) -> Option<TileLoadRequest> {
        self.heap.lock().pop()
    }

    /// Take the highest-priority job, parking up to `timeout` if none is queued.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<TileLoadRequest> {
        let mut heap = self.heap.lock();
        if heap.is_empty() {
            self.available.wait_for(&mut heap, timeout);
        }
        heap.pop()
    }

    /// Drop a queued job. False if a worker already took it (or it never existed).
    pub fn remove(&self, id: RequestId) -> bool {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|r| r.id != id);
        heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Remove every queued job, highest priority first.
    pub fn drain(&self) -> Vec<TileLoadRequest> {
        let heap = std::mem::take(&mut *self.heap.lock());
        heap.into_sorted_vec().into_iter().rev().collect()
    }

    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}
