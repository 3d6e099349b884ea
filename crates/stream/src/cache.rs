use glam::Vec3;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::generator::TileData;

/// Cache key: exact tile position plus LOD.
///
/// Positions are compared bit-for-bit (with `-0.0` folded into `0.0`), so a
/// tile is only shared between requests that name the same origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    position: [u32; 3],
    pub lod: u32,
}

impl TileKey {
    pub fn new(position: Vec3, lod: u32) -> Self {
        let bits = |v: f32| (v + 0.0).to_bits();
        Self {
            position: [bits(position.x), bits(position.y), bits(position.z)],
            lod,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(
            f32::from_bits(self.position[0]),
            f32::from_bits(self.position[1]),
            f32::from_bits(self.position[2]),
        )
    }
}

#[derive(Debug, Clone)]
pub struct TileCacheEntry {
    pub tile: TileData,
    /// Logical access clock value of the last touch. Larger is more recent.
    pub last_access: u64,
    pub access_count: u64,
    pub inserted_at: Instant,
}

/// Bounded tile cache with least-recently-used eviction.
///
/// Recency uses a logical clock bumped on every insert and every successful
/// [`TileCache::get`], so two touches in the same instant still order
/// correctly.
#[derive(Debug)]
pub struct TileCache {
    entries: HashMap<TileKey, TileCacheEntry>,
    recency: BTreeMap<u64, TileKey>,
    clock: u64,
    max_size: usize,
}

impl TileCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change capacity, evicting least-recently-used entries if shrinking.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        let excess = self.entries.len().saturating_sub(max_size);
        self.evict_lru(excess);
    }

    /// Membership test that does not count as an access.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Entry metadata without touching recency.
    pub fn peek(&self, key: &TileKey) -> Option<&TileCacheEntry> {
        self.entries.get(key)
    }

    /// Fetch a tile and mark it most recently used.
    pub fn get(&mut self, key: &TileKey) -> Option<TileData> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.last_access);
        entry.last_access = stamp;
        entry.access_count += 1;
        self.recency.insert(stamp, *key);
        Some(entry.tile.clone())
    }

    /// Insert or replace a tile, evicting the least recently used entries
    /// first if the cache is full. Returns the evicted keys.
    pub fn insert(&mut self, key: TileKey, tile: TileData) -> Vec<TileKey> {
        if self.max_size == 0 {
            return Vec::new();
        }
        let stamp = self.tick();
        if let Some(entry) = self.entries.get_mut(&key) {
            self.recency.remove(&entry.last_access);
            entry.tile = tile;
            entry.last_access = stamp;
            self.recency.insert(stamp, key);
            return Vec::new();
        }
        let excess = (self.entries.len() + 1).saturating_sub(self.max_size);
        let evicted = self.evict_lru(excess);
        self.entries.insert(
            key,
            TileCacheEntry {
                tile,
                last_access: stamp,
                access_count: 0,
                inserted_at: Instant::now(),
            },
        );
        self.recency.insert(stamp, key);
        evicted
    }

    /// Remove the `count` least recently used entries, or everything if fewer
    /// remain. Returns the evicted keys, oldest first.
    pub fn evict_lru(&mut self, count: usize) -> Vec<TileKey> {
        let mut evicted = Vec::with_capacity(count.min(self.entries.len()));
        while evicted.len() < count {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        if !evicted.is_empty() {
            tracing::trace!(count = evicted.len(), "evicted LRU tiles");
        }
        evicted
    }

    pub fn remove(&mut self, key: &TileKey) -> Option<TileData> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        Some(entry.tile)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
