//! Three-tier permission cache
//!
//! # Architecture
//!
//! ```text
//! get:  L1 (LRU, 5m) ─miss→ L2 (kv, 15m) ─miss→ L3 (durable, 30m)
//!         ↑ warm ←──────────────┘ ↑ warm ←──────────┘
//! set:  L1 now; L3 then L2 through the cache worker pool
//! ```
//!
//! L2 is only written once the L3 row exists, so the L3 table doubles as the
//! index of every `(user, organization)` pair held in a shared tier.
//!
//! Tiers are independent: each has its own TTL and may evict on its own. An
//! entry whose `expires_at` has passed, or whose version differs from the
//! engine's, is never returned from any tier.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use memory::{LocalCache, LocalCacheStats};
#[cfg(feature = "postgres")]
pub use postgres::PostgresDurableStore;
pub use store::{DurableStore, InMemoryDurableStore, InMemoryKeyValueStore, KeyValueStore};

use crate::clock::{to_chrono, Clock};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::manifest::CachedPermissions;
use crate::types::{OrganizationId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `(user, organization)` cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
}

impl CacheKey {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
        }
    }

    /// Key used at L2: `permissions:{user}:{org}`
    pub fn storage_key(&self) -> String {
        format!("{}{}:{}", STORAGE_PREFIX, self.user_id, self.organization_id)
    }
}

/// Prefix of every L2 key
pub const STORAGE_PREFIX: &str = "permissions:";

/// Tier that served a cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Shared,
    Durable,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub local: LocalCacheStats,
    pub shared_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hits over lookups across all tiers
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local.hits + self.shared_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// L1/L2/L3 permission cache
pub struct PermissionCache {
    local: LocalCache,
    shared: Arc<dyn KeyValueStore>,
    durable: Arc<dyn DurableStore>,
    config: CacheConfig,
    version: String,
    clock: Arc<dyn Clock>,

    /// Monotonic invalidation counter
    epoch: AtomicU64,
    /// Epoch and time of each key's last invalidation
    invalidated_at: DashMap<CacheKey, (u64, DateTime<Utc>)>,
    /// Values computed before this epoch are never written
    flushed_at: AtomicU64,

    shared_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
}

impl PermissionCache {
    pub fn new(
        config: CacheConfig,
        version: impl Into<String>,
        shared: Arc<dyn KeyValueStore>,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local: LocalCache::new(config.l1_capacity, config.l1_ttl, clock.clone()),
            shared,
            durable,
            config,
            version: version.into(),
            clock,
            epoch: AtomicU64::new(0),
            invalidated_at: DashMap::new(),
            flushed_at: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`, warming faster tiers on a slower-tier hit
    ///
    /// L2 failures and undecodable payloads count as misses. L3 failures are
    /// returned.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<(CachedPermissions, CacheTier)>> {
        if let Some(hit) = self.local.get(key) {
            return Ok(Some((hit.as_ref().clone(), CacheTier::Local)));
        }

        let storage_key = key.storage_key();
        match self.shared.get(&storage_key).await {
            Ok(Some(bytes)) => {
                if let Some(value) = self.accept(key, &bytes, CacheTier::Shared) {
                    self.shared_hits.fetch_add(1, Ordering::Relaxed);
                    self.local
                        .insert(key.clone(), Arc::new(value.clone()), self.config.l1_ttl);
                    debug!(user_id = %key.user_id, organization_id = %key.organization_id, "L2 hit");
                    return Ok(Some((value, CacheTier::Shared)));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key = %storage_key, error = %e, "L2 read failed, falling through"),
        }

        let now = self.clock.now();
        if let Some(bytes) = self
            .durable
            .get(&key.user_id, &key.organization_id, now)
            .await?
        {
            if let Some(value) = self.accept(key, &bytes, CacheTier::Durable) {
                self.durable_hits.fetch_add(1, Ordering::Relaxed);

                let remaining = (value.expires_at - now).to_std().unwrap_or_default();
                if let Err(e) = self
                    .shared
                    .set(&storage_key, bytes, remaining.min(self.config.l2_ttl))
                    .await
                {
                    warn!(key = %storage_key, error = %e, "L2 warm from L3 failed");
                }
                self.local
                    .insert(key.clone(), Arc::new(value.clone()), self.config.l1_ttl);
                debug!(user_id = %key.user_id, organization_id = %key.organization_id, "L3 hit");
                return Ok(Some((value, CacheTier::Durable)));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Decode and validate a tier payload
    fn accept(&self, key: &CacheKey, bytes: &[u8], tier: CacheTier) -> Option<CachedPermissions> {
        let value = match CachedPermissions::decode(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(user_id = %key.user_id, organization_id = %key.organization_id, ?tier, error = %e, "discarding undecodable cache entry");
                return None;
            }
        };
        if value.version != self.version {
            debug!(?tier, cached = %value.version, current = %self.version, "discarding cache entry with stale version");
            return None;
        }
        if value.is_expired(self.clock.now()) {
            return None;
        }
        Some(value)
    }

    /// Write L1 for `min(ttl_hint, L1 TTL)` unless `key` was invalidated after `generation`
    pub fn set_local(&self, key: &CacheKey, value: &CachedPermissions, ttl_hint: Duration, generation: u64) -> bool {
        if !self.is_current(key, generation) {
            debug!(user_id = %key.user_id, organization_id = %key.organization_id, "skipping L1 write for invalidated key");
            return false;
        }
        self.local.insert(key.clone(), Arc::new(value.clone()), ttl_hint);
        true
    }

    /// Write L3, then L2 (best effort)
    ///
    /// # Errors
    ///
    /// Only L3 failures are returned, and L2 is left untouched on one; L2
    /// failures are logged.
    pub async fn set_shared(&self, key: &CacheKey, value: &CachedPermissions, ttl_hint: Duration) -> Result<()> {
        let bytes = value.encode()?;
        let expires_at = (self.clock.now() + to_chrono(self.config.l3_ttl)).min(value.expires_at);
        self.durable
            .upsert(&key.user_id, &key.organization_id, bytes.clone(), expires_at)
            .await?;

        let storage_key = key.storage_key();
        if let Err(e) = self
            .shared
            .set(&storage_key, bytes, ttl_hint.min(self.config.l2_ttl))
            .await
        {
            warn!(key = %storage_key, error = %e, "L2 write failed");
        }
        Ok(())
    }

    /// Write every tier
    pub async fn set(&self, key: &CacheKey, value: &CachedPermissions, ttl_hint: Duration) -> Result<()> {
        let generation = self.generation();
        self.set_local(key, value, ttl_hint, generation);
        self.set_shared(key, value, ttl_hint).await
    }

    /// Remove `key` from every tier and mark it invalidated
    pub async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.mark_invalidated(key);
        self.local.remove(key);

        let storage_key = key.storage_key();
        if let Err(e) = self.shared.delete(&storage_key).await {
            warn!(key = %storage_key, error = %e, "L2 delete failed");
        }

        self.durable.delete(&key.user_id, &key.organization_id).await
    }

    /// Remove `key` from L1 and L2, keeping the L3 row for overwrite
    pub async fn evict_hot(&self, key: &CacheKey) {
        self.mark_invalidated(key);
        self.local.remove(key);

        let storage_key = key.storage_key();
        if let Err(e) = self.shared.delete(&storage_key).await {
            warn!(key = %storage_key, error = %e, "L2 delete failed");
        }
    }

    /// Pattern delete
    ///
    /// Flushes L1 entirely. L2 and L3 are not scanned; their entries age out
    /// through TTL, and version checks on read cover schema changes.
    pub fn delete_pattern(&self, prefix: &str) -> usize {
        let removed = self.flush_local();
        info!(prefix, removed, "pattern delete flushed L1; L2/L3 rely on TTL");
        removed
    }

    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        if self.local.contains(key) {
            return Ok(true);
        }

        let storage_key = key.storage_key();
        match self.shared.exists(&storage_key).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => warn!(key = %storage_key, error = %e, "L2 exists failed"),
        }

        self.durable
            .exists(&key.user_id, &key.organization_id, self.clock.now())
            .await
    }

    /// Version string of the cached entry
    pub async fn version(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.get(key).await?.map(|(value, _)| value.version))
    }

    /// Every key held in L1 or L3, narrowed to a user and/or organization
    ///
    /// Covers pairs the repositories no longer know about, such as a revoked
    /// membership whose manifest is still cached.
    pub async fn cached_keys(&self, user_id: Option<&str>, organization_id: Option<&str>) -> Result<BTreeSet<CacheKey>> {
        let mut keys: BTreeSet<CacheKey> = self
            .local
            .keys_where(|k| {
                user_id.map_or(true, |wanted| k.user_id == wanted)
                    && organization_id.map_or(true, |wanted| k.organization_id == wanted)
            })
            .into_iter()
            .collect();
        for (user_id, organization_id) in self.durable.list_keys(user_id, organization_id).await? {
            keys.insert(CacheKey::new(user_id, organization_id));
        }
        Ok(keys)
    }

    /// Evict one key from L1
    pub fn evict_local(&self, key: &CacheKey) -> bool {
        self.mark_invalidated(key);
        self.local.remove(key)
    }

    /// Evict every L1 entry of a user
    pub fn evict_local_user(&self, user_id: &str) -> usize {
        self.evict_local_where(|k| k.user_id == user_id)
    }

    /// Evict every L1 entry of an organization
    pub fn evict_local_organization(&self, organization_id: &str) -> usize {
        self.evict_local_where(|k| k.organization_id == organization_id)
    }

    fn evict_local_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        // Entries not in L1 may still have jobs in flight
        self.bump_flush();
        self.local.remove_where(predicate)
    }

    /// Drop every L1 entry
    pub fn flush_local(&self) -> usize {
        self.bump_flush();
        self.local.clear()
    }

    /// Remove expired L1 entries and retire old invalidation marks
    pub fn sweep_local(&self) -> usize {
        self.prune_invalidations();
        self.local.sweep()
    }

    /// Drop invalidation marks older than the L3 TTL
    ///
    /// Raises the write floor to the newest dropped epoch, so a value computed
    /// before any retired mark is still refused.
    fn prune_invalidations(&self) -> usize {
        let cutoff = self.clock.now() - to_chrono(self.config.l3_ttl);
        let mut newest_dropped = 0;
        self.invalidated_at.retain(|_, (epoch, at)| {
            let keep = *at > cutoff;
            if !keep {
                newest_dropped = newest_dropped.max(*epoch);
            }
            keep
        });
        if newest_dropped > 0 {
            self.flushed_at.fetch_max(newest_dropped, Ordering::SeqCst);
            debug!(floor = newest_dropped, "retired invalidation marks");
        }
        self.invalidated_at.len()
    }

    /// Purge expired L3 rows
    pub async fn compact(&self) -> Result<u64> {
        let purged = self.durable.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            info!(purged, "compacted durable cache");
        }
        Ok(purged)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local: self.local.stats(),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Current invalidation generation; capture before computing a value
    pub fn generation(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a value computed at `generation` may still be written for `key`
    pub fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        if self.flushed_at.load(Ordering::SeqCst) > generation {
            return false;
        }
        self.invalidated_at
            .get(key)
            .map_or(true, |mark| mark.0 <= generation)
    }

    fn mark_invalidated(&self, key: &CacheKey) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.invalidated_at.insert(key.clone(), (epoch, self.clock.now()));
    }

    fn bump_flush(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.flushed_at.fetch_max(epoch, Ordering::SeqCst);
        self.invalidated_at.clear();
    }
}
