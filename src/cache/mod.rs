//! Per-DAO result cache.
//!
//! Reads go through [`DaoCache::cached_call`]; writes go through
//! [`DaoCache::invalidating_call`], which clears the whole cache when the
//! method name matches a refresh filter. Entries expire lazily: an absolute
//! live time from creation and a sliding idle time since the last hit are
//! checked when the entry is looked up.

mod clock;
mod filter;
mod key;
mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, trace};

pub use clock::{Clock, ManualClock, SystemClock};
pub use filter::{RefreshFilter, RefreshFilters};
pub use key::CacheKey;
pub use store::{CacheEntry, CacheStore, LruStore};

use crate::error::{DaoError, Result};
use crate::value::Value;

/// How cached values are handed to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    /// Every hit receives its own deep copy.
    #[default]
    Copy,
    /// Hits share the cached instance.
    Reference,
}

/// Cache limits. Time values are milliseconds; `0` disables that expiry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Absolute lifetime from creation.
    pub live_time_ms: u64,
    /// Lifetime since the last hit.
    pub idle_time_ms: u64,
    /// Smallest collection result worth caching.
    pub min_size: usize,
    /// Largest collection result worth caching, unbounded when unset.
    pub max_size: Option<usize>,
    /// Copy or share cached values.
    pub transfer: TransferStrategy,
    /// Lock partitions of the default store.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            live_time_ms: 0,
            idle_time_ms: 0,
            min_size: 0,
            max_size: None,
            transfer: TransferStrategy::Copy,
            shards: 1,
        }
    }
}

impl CacheConfig {
    /// Checks the limits for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(DaoError::config("cache capacity must be positive"));
        }
        if self.shards == 0 || self.shards > self.capacity {
            return Err(DaoError::config(format!(
                "cache shards must be between 1 and capacity ({}), got {}",
                self.capacity, self.shards
            )));
        }
        if let Some(max) = self.max_size {
            if self.min_size > max {
                return Err(DaoError::config(format!(
                    "cache min_size {} exceeds max_size {max}",
                    self.min_size
                )));
            }
        }
        Ok(())
    }

    fn admits(&self, size: usize) -> bool {
        size >= self.min_size && self.max_size.map_or(true, |max| size <= max)
    }
}

/// Element count of collection-shaped results, used for size gating.
pub trait ResultSize {
    /// `None` for results that are not collections; those are always cached.
    fn result_size(&self) -> Option<usize>;
}

impl<T> ResultSize for Vec<T> {
    fn result_size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ResultSize for Value {
    fn result_size(&self) -> Option<usize> {
        self.as_list().map(<[Value]>::len)
    }
}

impl<T: ResultSize> ResultSize for Option<T> {
    fn result_size(&self) -> Option<usize> {
        self.as_ref().and_then(ResultSize::result_size)
    }
}

/// Counters since construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to compute.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their live or idle time ran out.
    pub expirations: u64,
    /// Whole-cache invalidations.
    pub invalidations: u64,
    /// Results returned without being stored because of size gating.
    pub bypassed: u64,
    /// Bumped by every invalidation.
    pub generation: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    bypassed: AtomicU64,
}

/// Capacity and time bounded cache for one DAO.
pub struct DaoCache<V> {
    config: CacheConfig,
    filters: RefreshFilters,
    store: Arc<dyn CacheStore<V>>,
    clock: Arc<dyn Clock>,
    // Inserts hold the read side while checking that no invalidation ran
    // since their compute started; invalidation holds the write side.
    generation: RwLock<u64>,
    counters: Counters,
}

impl<V> DaoCache<V>
where
    V: Clone + ResultSize + Send + Sync + 'static,
{
    /// Cache over the default [`LruStore`] and the system clock.
    pub fn new(config: CacheConfig, filters: RefreshFilters) -> Result<Self> {
        config.validate()?;
        let store: Arc<LruStore<V>> =
            Arc::new(LruStore::with_shards(config.capacity, config.shards)?);
        Ok(Self::with_store(config, filters, store, Arc::new(SystemClock::default())))
    }

    /// Cache over a caller-supplied store and clock.
    pub fn with_store(
        config: CacheConfig,
        filters: RefreshFilters,
        store: Arc<dyn CacheStore<V>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            filters,
            store,
            clock,
            generation: RwLock::new(0),
            counters: Counters::default(),
        }
    }

    /// Active limits.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cached value for `key` or computes, stores and returns it.
    ///
    /// A failed compute is returned untouched and nothing is stored. A value
    /// computed across a concurrent invalidation is returned but not stored.
    pub fn cached_call<F>(&self, key: &CacheKey, compute: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!(%key, "cache miss");

        let started_at = *self.generation.read();
        let value = compute()?;
        let size = value.result_size();
        if let Some(size) = size.filter(|&n| !self.config.admits(n)) {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            debug!(%key, size, "result size outside cache limits; not stored");
            return Ok(Arc::new(value));
        }

        let stored = Arc::new(value);
        let returned = match self.config.transfer {
            TransferStrategy::Reference => Arc::clone(&stored),
            TransferStrategy::Copy => Arc::new(V::clone(&stored)),
        };
        self.insert_if_current(key, stored, started_at);
        Ok(returned)
    }

    /// Looks `key` up without computing. Expired entries are evicted and
    /// reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let entry = self.store.get(key)?;
        let now = self.clock.now_ms();
        if self.is_expired(&entry, now) {
            if self.store.remove_entry(key, &entry) {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "cache entry expired");
            }
            return None;
        }
        entry.touch(now);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        trace!(%key, "cache hit");
        Some(match self.config.transfer {
            TransferStrategy::Reference => Arc::clone(entry.value()),
            TransferStrategy::Copy => Arc::new(V::clone(entry.value())),
        })
    }

    /// Runs a write. When `method` matches a refresh filter the whole cache
    /// is cleared afterwards, whether or not the write succeeded, since a
    /// failed batch may still have applied earlier chunks.
    pub fn invalidating_call<T, F>(&self, method: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let result = compute();
        if self.filters.matches(method) {
            self.invalidate();
        }
        result
    }

    /// True when a write named `method` would clear the cache.
    pub fn is_refreshed_by(&self, method: &str) -> bool {
        self.filters.matches(method)
    }

    /// Clears every entry.
    pub fn invalidate(&self) {
        let mut generation = self.generation.write();
        *generation += 1;
        let dropped = self.store.clear();
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(generation = *generation, dropped, "cache invalidated");
    }

    /// Number of stored entries, expired ones included until looked up.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            entries: self.store.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            bypassed: c.bypassed.load(Ordering::Relaxed),
            generation: *self.generation.read(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: u64) -> bool {
        let live = self.config.live_time_ms;
        let idle = self.config.idle_time_ms;
        (live > 0 && now.saturating_sub(entry.created_at()) >= live)
            || (idle > 0 && now.saturating_sub(entry.last_accessed()) >= idle)
    }

    fn insert_if_current(&self, key: &CacheKey, value: Arc<V>, started_at: u64) {
        let generation = self.generation.read();
        if *generation != started_at {
            debug!(%key, "cache invalidated during compute; result not stored");
            return;
        }
        let entry = Arc::new(CacheEntry::new(value, self.clock.now_ms()));
        if let Some(evicted) = self.store.insert(key.clone(), entry) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(%evicted, "cache eviction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn cache(config: CacheConfig) -> (Arc<ManualClock>, DaoCache<Vec<i64>>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(LruStore::<Vec<i64>>::new(config.capacity).unwrap());
        let filters = RefreshFilters::parse(["insert", "re:^delete"]).unwrap();
        let cache = DaoCache::with_store(config, filters, store, clock.clone());
        (clock, cache)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_parts("find", name)
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let (_, cache) = cache(CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        });
        cache.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        cache.cached_call(&key("b"), || Ok(vec![2])).unwrap();
        assert!(cache.get(&key("a")).is_some());
        cache.cached_call(&key("c"), || Ok(vec![3])).unwrap();
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn live_time_is_absolute() {
        let (clock, cache) = cache(CacheConfig {
            live_time_ms: 100,
            ..CacheConfig::default()
        });
        cache.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        clock.set(50);
        assert!(cache.get(&key("a")).is_some());
        clock.set(150);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn idle_time_slides_with_access() {
        let (clock, cache) = cache(CacheConfig {
            idle_time_ms: 100,
            ..CacheConfig::default()
        });
        cache.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        clock.set(80);
        assert!(cache.get(&key("a")).is_some());
        clock.set(160);
        assert!(cache.get(&key("a")).is_some());
        clock.set(300);
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn matching_write_clears_everything() {
        let (_, cache) = cache(CacheConfig::default());
        let computed = AtomicUsize::new(0);
        let read = || {
            cache
                .cached_call(&key("a"), || {
                    computed.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1])
                })
                .unwrap()
        };
        read();
        read();
        assert_eq!(computed.load(Ordering::SeqCst), 1);

        cache.invalidating_call("updateName", || Ok(())).unwrap();
        read();
        assert_eq!(computed.load(Ordering::SeqCst), 1);

        cache.invalidating_call("bulkInsertUsers", || Ok(())).unwrap();
        assert!(cache.is_empty());
        read();
        assert_eq!(computed.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().generation, 1);
    }

    #[test]
    fn failed_writes_still_invalidate() {
        let (_, cache) = cache(CacheConfig::default());
        cache.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        let err = cache
            .invalidating_call::<(), _>("deleteAll", || Err(DaoError::Execution("x".into())))
            .unwrap_err();
        assert_eq!(err.code(), "ExecutionFailed");
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let (_, cache) = cache(CacheConfig::default());
        assert!(cache
            .cached_call(&key("a"), || Err(DaoError::Execution("down".into())))
            .is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.cached_call(&key("a"), || Ok(vec![7])).unwrap(), vec![7]);
    }

    #[test]
    fn size_gating_bypasses_but_returns() {
        let (_, cache) = cache(CacheConfig {
            min_size: 1,
            max_size: Some(2),
            ..CacheConfig::default()
        });
        assert!(cache.cached_call(&key("empty"), || Ok(vec![])).unwrap().is_empty());
        assert_eq!(cache.cached_call(&key("big"), || Ok(vec![1, 2, 3])).unwrap().len(), 3);
        cache.cached_call(&key("ok"), || Ok(vec![1, 2])).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().bypassed, 2);
    }

    #[test]
    fn transfer_strategy_controls_sharing() {
        let (_, copying) = cache(CacheConfig::default());
        let first = copying.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        let second = copying.cached_call(&key("a"), || Ok(vec![2])).unwrap();
        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first, &second));

        let (_, sharing) = cache(CacheConfig {
            transfer: TransferStrategy::Reference,
            ..CacheConfig::default()
        });
        let first = sharing.cached_call(&key("a"), || Ok(vec![1])).unwrap();
        let second = sharing.cached_call(&key("a"), || Ok(vec![2])).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalidation_during_compute_discards_result() {
        let (_, cache) = cache(CacheConfig::default());
        let value = cache
            .cached_call(&key("a"), || {
                cache.invalidate();
                Ok(vec![1])
            })
            .unwrap();
        assert_eq!(*value, vec![1]);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_reads_and_invalidations() {
        let (_, cache) = cache(CacheConfig {
            capacity: 16,
            ..CacheConfig::default()
        });
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200i64 {
                        let k = key(&(i % 24).to_string());
                        let v = cache.cached_call(&k, || Ok(vec![i % 24])).unwrap();
                        assert_eq!(v[0], i % 24);
                        if t == 0 && i % 50 == 0 {
                            cache.invalidate();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 8 * 200);
    }

    #[test]
    fn config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig {
            capacity: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
        assert!(CacheConfig {
            min_size: 5,
            max_size: Some(2),
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
    }
}
