//! Shared TTL result cache with access-count eviction.
//!
//! Keys are a stable 64-bit hash of `(primary, context)`; values are cloned
//! out on hit. Expiry is lazy: an entry past its TTL is deleted at the
//! access that discovers it and counted as a miss. When `put` would exceed
//! capacity, the entry with the lowest `access_count` is evicted first, ties
//! broken by oldest `inserted_at`.
//!
//! The cache is the only shared mutable structure in the pipeline; a single
//! `parking_lot::Mutex` is sufficient at the expected scale of hundreds to
//! low-thousands of entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fxhash::FxHasher64;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};

/// Default entry lifetime when `put` is called without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default maximum number of entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Stable cache key for a `(primary, context)` pair.
pub fn cache_key(primary: &str, context: &str) -> u64 {
    let mut hasher = FxHasher64::default();
    primary.hash(&mut hasher);
    "|".hash(&mut hasher);
    context.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<u64, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// TTL + access-count eviction cache, safe for concurrent get/put.
#[derive(Debug)]
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    /// Look up `(primary, context)`. An expired entry is removed here and
    /// counted as a miss.
    pub fn get(&self, primary: &str, context: &str) -> Option<V> {
        let key = cache_key(primary, context);
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.get(&key).map(|entry| entry.expired(now)) {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.remove(&key);
                inner.misses += 1;
                None
            }
            Some(false) => {
                inner.hits += 1;
                let entry = inner.entries.get_mut(&key).expect("entry present");
                entry.access_count += 1;
                Some(entry.value.clone())
            }
        }
    }

    /// Insert a value, evicting one entry first if at capacity.
    pub fn put(&self, primary: &str, context: &str, value: V, ttl: Option<Duration>) {
        let key = cache_key(primary, context);
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(victim) = Self::eviction_victim(&inner.entries) {
                tracing::debug!(key = victim, "cache_evict");
                inner.entries.remove(&victim);
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                access_count: 0,
            },
        );
    }

    /// Lowest access count wins; ties broken by oldest insertion.
    fn eviction_victim<W>(entries: &HashMap<u64, CacheEntry<W>>) -> Option<u64> {
        entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.access_count
                    .cmp(&b.access_count)
                    .then_with(|| a.inserted_at.cmp(&b.inserted_at))
            })
            .map(|(k, _)| *k)
    }

    /// Remove every TTL-expired entry, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.expired(now));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
