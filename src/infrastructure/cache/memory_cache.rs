//! In-memory LRU image cache bounded by pixel cost and entry count.

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, DecodedImage};

struct CostedImage {
    image: DecodedImage,
    cost: u64,
}

struct MemoryState {
    entries: LruCache<CacheKey, CostedImage>,
    total_cost: u64,
    max_cost: u64,
    max_count: usize,
}

impl MemoryState {
    fn over_limits(&self) -> bool {
        (self.max_cost > 0 && self.total_cost > self.max_cost)
            || (self.max_count > 0 && self.entries.len() > self.max_count)
    }

    fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_limits() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_cost -= entry.cost;
            evicted += 1;
            trace!(key = %key, cost = entry.cost, "Evicted image from memory cache");
        }
        evicted
    }
}

/// In-memory LRU cache for decoded images.
///
/// Thread-safe; every operation takes one short internal lock and never
/// touches the disk. A limit of 0 means unlimited.
pub struct MemoryImageCache {
    state: Mutex<MemoryState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a cache with the given cost and count limits.
    #[must_use]
    pub fn new(max_cost: u64, max_count: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                total_cost: 0,
                max_cost,
                max_count,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates an unbounded cache.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0, 0)
    }

    /// Returns the image and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<DecodedImage> {
        let image = self.state.lock().entries.get(key).map(|e| e.image.clone());
        if image.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
        }
        image
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<DecodedImage> {
        self.state.lock().entries.peek(key).map(|e| e.image.clone())
    }

    /// Returns true if the key is cached.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Stores an image with its pixel cost, evicting LRU entries as needed.
    pub fn put(&self, key: CacheKey, image: DecodedImage) {
        let cost = image.cost();
        self.put_with_cost(key, image, cost);
    }

    /// Stores an image with an explicit cost.
    pub fn put_with_cost(&self, key: CacheKey, image: DecodedImage, cost: u64) {
        let mut state = self.state.lock();
        if let Some(old) = state.entries.put(key.clone(), CostedImage { image, cost }) {
            state.total_cost -= old.cost;
        }
        state.total_cost += cost;
        let evicted = state.evict_to_limits();
        trace!(
            key = %key,
            cost,
            total_cost = state.total_cost,
            evicted,
            "Stored image in memory cache"
        );
    }

    /// Removes an image.
    pub fn remove(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(key) {
            state.total_cost -= entry.cost;
            trace!(key = %key, "Removed image from memory cache");
        }
    }

    /// Drops every entry. Wired to memory-pressure notifications.
    pub fn purge_all(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.total_cost = 0;
        debug!(count, "Purged memory image cache");
    }

    /// Changes the cost limit and evicts immediately if needed.
    pub fn set_max_cost(&self, max_cost: u64) {
        let mut state = self.state.lock();
        state.max_cost = max_cost;
        state.evict_to_limits();
    }

    /// Changes the count limit and evicts immediately if needed.
    pub fn set_max_count(&self, max_count: usize) {
        let mut state = self.state.lock();
        state.max_count = max_count;
        state.evict_to_limits();
    }

    /// Current cost limit (0 = unlimited).
    pub fn max_cost(&self) -> u64 {
        self.state.lock().max_cost
    }

    /// Current count limit (0 = unlimited).
    pub fn max_count(&self) -> usize {
        self.state.lock().max_count
    }

    /// Number of cached images.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the costs of all cached images.
    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let state = self.state.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: state.entries.len(),
            total_cost: state.total_cost,
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Current total pixel cost.
    pub total_cost: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} px), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}
