use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::CacheKey;
use crate::error::{DaoError, Result};

/// One cached result with its timestamps.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: Arc<V>,
    created_at: u64,
    last_accessed: AtomicU64,
}

impl<V> CacheEntry<V> {
    /// Creates an entry stamped at `now_ms`.
    pub fn new(value: Arc<V>, now_ms: u64) -> Self {
        Self {
            value,
            created_at: now_ms,
            last_accessed: AtomicU64::new(now_ms),
        }
    }

    /// Cached value.
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    /// Insertion time.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the most recent hit.
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Records a hit at `now_ms`.
    pub fn touch(&self, now_ms: u64) {
        self.last_accessed.fetch_max(now_ms, Ordering::Relaxed);
    }
}

/// Capacity-bounded key/value map with least-recently-used eviction.
///
/// Implementations must make each call atomic with respect to the others:
/// in particular `clear` is never observed half done.
pub trait CacheStore<V>: Send + Sync {
    /// Returns the entry and marks it most recently used.
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>>;

    /// Inserts or replaces an entry. Returns the key evicted to make room.
    fn insert(&self, key: CacheKey, entry: Arc<CacheEntry<V>>) -> Option<CacheKey>;

    /// Removes `key` only while it still maps to `entry`.
    fn remove_entry(&self, key: &CacheKey, entry: &Arc<CacheEntry<V>>) -> bool;

    /// Drops every entry and returns how many there were.
    fn clear(&self) -> usize;

    /// Number of entries.
    fn len(&self) -> usize;

    /// True when the store holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    fn capacity(&self) -> usize;
}

type Shard<V> = Mutex<LruCache<CacheKey, Arc<CacheEntry<V>>>>;

/// In-process store built on `lru::LruCache`.
///
/// With one shard eviction is exact LRU over the whole store. More shards
/// reduce lock contention; capacity and recency are then tracked per shard.
pub struct LruStore<V> {
    shards: Vec<Shard<V>>,
    capacity: usize,
}

impl<V> LruStore<V> {
    /// Single-shard store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_shards(capacity, 1)
    }

    /// Store split into `shards` independently locked partitions.
    pub fn with_shards(capacity: usize, shards: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DaoError::config("cache capacity must be positive"));
        }
        let shard_count = shards.max(1).min(capacity);
        let per_shard = NonZeroUsize::new(capacity / shard_count)
            .ok_or_else(|| DaoError::config("cache capacity must be positive"))?;
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Ok(Self {
            shards,
            capacity: per_shard.get() * shard_count,
        })
    }

    fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        let idx = (key.fingerprint() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}

impl<V: Send + Sync> CacheStore<V> for LruStore<V> {
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        self.shard_for(key).lock().get(key).cloned()
    }

    fn insert(&self, key: CacheKey, entry: Arc<CacheEntry<V>>) -> Option<CacheKey> {
        let mut shard = self.shard_for(&key).lock();
        match shard.push(key.clone(), entry) {
            Some((old, _)) if old != key => Some(old),
            _ => None,
        }
    }

    fn remove_entry(&self, key: &CacheKey, entry: &Arc<CacheEntry<V>>) -> bool {
        let mut shard = self.shard_for(key).lock();
        match shard.peek(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                shard.pop(key);
                true
            }
            _ => false,
        }
    }

    fn clear(&self) -> usize {
        // Every shard stays locked until all are empty.
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.lock()).collect();
        guards
            .iter_mut()
            .map(|guard| {
                let n = guard.len();
                guard.clear();
                n
            })
            .sum()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
