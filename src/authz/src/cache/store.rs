//! Shared (L2) and durable (L3) cache tiers

use crate::clock::{to_chrono, Clock};
use crate::error::{AuthzError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Distributed key-value store (L2). Values expire after their TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Durable store (L3) keyed by `(user, organization)` with an `expires_at` column
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Payload of a row with `expires_at > now`
    async fn get(&self, user_id: &str, organization_id: &str, now: DateTime<Utc>) -> Result<Option<Vec<u8>>>;

    async fn upsert(
        &self,
        user_id: &str,
        organization_id: &str,
        payload: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, user_id: &str, organization_id: &str) -> Result<()>;

    async fn exists(&self, user_id: &str, organization_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Remove every row with `expires_at <= now`; returns the number removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// `(user, organization)` pairs with a stored row, narrowed by whichever
    /// filters are given. Expired rows are included.
    async fn list_keys(&self, user_id: Option<&str>, organization_id: Option<&str>) -> Result<Vec<(String, String)>>;
}

/// In-process [`KeyValueStore`] with clock-driven TTL
///
/// `set_unavailable(true)` makes every call fail, for exercising fallbacks.
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryKeyValueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthzError::CacheFailure("key-value store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let live = entries
            .get(key)
            .map(|(value, expires_at)| (*expires_at > now).then(|| value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = self.clock.now() + to_chrono(ttl);
        self.entries.lock().insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .map_or(false, |(_, expires_at)| *expires_at > now))
    }
}

/// In-process [`DurableStore`]
pub struct InMemoryDurableStore {
    rows: Mutex<HashMap<(String, String), (Vec<u8>, DateTime<Utc>)>>,
    unavailable: AtomicBool,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored rows, expired ones included
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthzError::RepositoryFailure("durable store unavailable".into()));
        }
        Ok(())
    }

    fn key(user_id: &str, organization_id: &str) -> (String, String) {
        (user_id.to_string(), organization_id.to_string())
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, user_id: &str, organization_id: &str, now: DateTime<Utc>) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .get(&Self::key(user_id, organization_id))
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(payload, _)| payload.clone()))
    }

    async fn upsert(
        &self,
        user_id: &str,
        organization_id: &str,
        payload: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        self.rows
            .lock()
            .insert(Self::key(user_id, organization_id), (payload, expires_at));
        Ok(())
    }

    async fn delete(&self, user_id: &str, organization_id: &str) -> Result<()> {
        self.check_available()?;
        self.rows.lock().remove(&Self::key(user_id, organization_id));
        Ok(())
    }

    async fn exists(&self, user_id: &str, organization_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .get(&Self::key(user_id, organization_id))
            .map_or(false, |(_, expires_at)| *expires_at > now))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - rows.len()) as u64)
    }

    async fn list_keys(&self, user_id: Option<&str>, organization_id: Option<&str>) -> Result<Vec<(String, String)>> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .keys()
            .filter(|(user, org)| {
                user_id.map_or(true, |wanted| user == wanted) && organization_id.map_or(true, |wanted| org == wanted)
            })
            .cloned()
            .collect())
    }
}
