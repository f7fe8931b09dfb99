//! Engine configuration
//!
//! Loaded by the host process (TOML or any serde format); the engine itself
//! reads no files or environment variables. Durations are whole seconds on the
//! wire except `retry_base_delay_ms`.

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache hierarchy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of L1 entries
    pub l1_capacity: usize,

    #[serde(rename = "l1_ttl_secs", with = "secs")]
    pub l1_ttl: Duration,

    /// Interval of the background L1 expiry sweep
    #[serde(rename = "l1_sweep_interval_secs", with = "secs")]
    pub l1_sweep_interval: Duration,

    #[serde(rename = "l2_ttl_secs", with = "secs")]
    pub l2_ttl: Duration,

    #[serde(rename = "l3_ttl_secs", with = "secs")]
    pub l3_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl: Duration::from_secs(5 * 60),
            l1_sweep_interval: Duration::from_secs(60),
            l2_ttl: Duration::from_secs(15 * 60),
            l3_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Cache worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,

    /// Bounded job channel capacity
    pub queue_capacity: usize,

    pub max_retries: u32,

    /// Linear backoff unit: attempt `n` sleeps `n * retry_base_delay`
    #[serde(rename = "retry_base_delay_ms", with = "millis")]
    pub retry_base_delay: Duration,

    #[serde(rename = "job_timeout_secs", with = "secs")]
    pub job_timeout: Duration,

    /// TTL used when workers write L2 and L3
    #[serde(rename = "cache_ttl_secs", with = "secs")]
    pub cache_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_000,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            job_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Invalidation coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Pub/sub channel for cross-process events
    pub channel: String,

    /// Default `Strategy::max_concurrent`
    pub max_concurrent: usize,

    /// Subscribe to peer events and evict L1 on receipt
    pub listen: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            channel: crate::invalidation::INVALIDATION_CHANNEL.to_string(),
            max_concurrent: 10,
            listen: true,
        }
    }
}

/// Permission engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Manifest schema version; cached entries with another version are ignored
    pub version: String,

    /// Lifetime of a freshly computed manifest
    #[serde(rename = "manifest_ttl_secs", with = "secs")]
    pub manifest_ttl: Duration,

    /// Enable metrics collection
    pub enable_metrics: bool,

    pub cache: CacheConfig,

    pub worker: WorkerConfig,

    pub invalidation: InvalidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "v3.0".to_string(),
            manifest_ttl: Duration::from_secs(30 * 60),
            enable_metrics: true,
            cache: CacheConfig::default(),
            worker: WorkerConfig::default(),
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)
            .map_err(|e| AuthzError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(AuthzError::InvalidConfig("version must not be empty".into()));
        }
        if self.manifest_ttl.is_zero() {
            return Err(AuthzError::InvalidConfig("manifest_ttl must be positive".into()));
        }
        if self.cache.l1_capacity == 0 {
            return Err(AuthzError::InvalidConfig("cache.l1_capacity must be positive".into()));
        }
        if self.cache.l1_ttl.is_zero() || self.cache.l2_ttl.is_zero() || self.cache.l3_ttl.is_zero() {
            return Err(AuthzError::InvalidConfig("cache TTLs must be positive".into()));
        }
        if self.cache.l1_sweep_interval.is_zero() {
            return Err(AuthzError::InvalidConfig("cache.l1_sweep_interval must be positive".into()));
        }
        if self.worker.workers == 0 {
            return Err(AuthzError::InvalidConfig("worker.workers must be positive".into()));
        }
        if self.worker.queue_capacity == 0 {
            return Err(AuthzError::InvalidConfig("worker.queue_capacity must be positive".into()));
        }
        if self.worker.job_timeout.is_zero() {
            return Err(AuthzError::InvalidConfig("worker.job_timeout must be positive".into()));
        }
        if self.invalidation.max_concurrent == 0 {
            return Err(AuthzError::InvalidConfig("invalidation.max_concurrent must be positive".into()));
        }
        if self.invalidation.channel.is_empty() {
            return Err(AuthzError::InvalidConfig("invalidation.channel must not be empty".into()));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
