//! Result cache bounded by TTL and entry count

use lru::LruCache;
use stackrelay_core::{Fingerprint, Payload};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A completed response with its storage timestamp.
struct CacheEntry {
    payload: Payload,
    stored_at: Instant,
}

impl CacheEntry {
    fn new(payload: Payload) -> Self {
        Self {
            payload,
            stored_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() >= ttl
    }
}

/// Content-addressed store of completed responses.
///
/// Entries are visible until their TTL elapses; beyond `capacity` entries the
/// least-recently-used one is evicted. Recency is refreshed on both hits and
/// stores. All mutations go through one internal lock, so the cache is safe
/// to share across workers.
pub struct ResultCache {
    inner: Mutex<LruCache<Fingerprint, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create a cache with the given entry capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a completed response. Expired entries are removed on access;
    /// a hit refreshes recency and bumps the hit counter.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Payload> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = cache.get(fingerprint) {
            if entry.is_expired(self.ttl) {
                cache.pop(fingerprint);
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.payload.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a completed response, evicting the least-recently-used entry if
    /// the cache is full.
    pub fn store(&self, fingerprint: Fingerprint, payload: Payload) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(fingerprint, CacheEntry::new(payload));
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let expired: Vec<Fingerprint> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired.len();
        for key in expired {
            cache.pop(&key);
        }
        count
    }

    /// Current number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime (hits, misses) counters.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
