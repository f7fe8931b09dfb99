//! In-process L1 cache: bounded LRU with clock-driven TTL

use super::CacheKey;
use crate::clock::{to_chrono, Clock};
use crate::manifest::CachedPermissions;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct LocalEntry {
    value: Arc<CachedPermissions>,
    expires_at: DateTime<Utc>,
}

/// L1 statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub entries: usize,
    pub max_entries: usize,
}

impl LocalCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU keyed by `(user, organization)`
///
/// Lookups take the read lock and do not refresh recency; the least recently
/// inserted entry is evicted on overflow.
pub struct LocalCache {
    entries: RwLock<LruCache<CacheKey, LocalEntry>>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl LocalCache {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let bound = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(bound)),
            capacity: bound.get(),
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedPermissions>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.peek(key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: re-check under the write lock, a writer may have refreshed it
        let mut entries = self.entries.write();
        if let Some(entry) = entries.peek(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert for `min(ttl_hint, L1 TTL)`, never past the value's own expiry
    pub fn insert(&self, key: CacheKey, value: Arc<CachedPermissions>, ttl_hint: Duration) {
        let now = self.clock.now();
        let expires_at = (now + to_chrono(ttl_hint.min(self.ttl))).min(value.expires_at);
        if expires_at <= now {
            return;
        }

        let mut entries = self.entries.write();
        if let Some((evicted, _)) = entries.push(key.clone(), LocalEntry { value, expires_at }) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Whether a live entry exists; does not count as a hit
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .peek(key)
            .map_or(false, |e| e.expires_at > now)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.write().pop(key).is_some()
    }

    /// Remove every entry matching `predicate`; returns how many were removed
    pub fn remove_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        let mut entries = self.entries.write();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Keys matching `predicate`, live or not
    pub fn keys_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            max_entries: self.capacity,
        }
    }
}
