//! Fixed-size Bloom filter over granted `resource:action` keys
//!
//! 10 KiB of bits and seven FNV-1a hashes seeded by hash index. A negative test
//! means the action is definitely not granted; a positive one still needs the
//! bitfield check. A zero-length filter passes every test so manifests written
//! before filters existed keep working.

use crate::error::{AuthzError, Result};
use crate::hash::fnv1a64_seeded;
use crate::manifest::CompiledPermissions;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Filter size in bytes
pub const BLOOM_FILTER_BYTES: usize = 10 * 1024;

/// Number of hash functions
pub const BLOOM_HASH_COUNT: u32 = 7;

#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
}

impl BloomFilter {
    /// All-zero filter of the standard size
    pub fn new() -> Self {
        Self {
            bits: vec![0; BLOOM_FILTER_BYTES],
        }
    }

    /// Zero-length filter; `test` always returns true
    pub fn empty() -> Self {
        Self { bits: Vec::new() }
    }

    /// Wrap raw bytes, accepting only the empty or the standard size
    pub fn from_bytes(bits: Vec<u8>) -> Result<Self> {
        if !bits.is_empty() && bits.len() != BLOOM_FILTER_BYTES {
            return Err(AuthzError::Serialization(format!(
                "bloom filter must be {} bytes, got {}",
                BLOOM_FILTER_BYTES,
                bits.len()
            )));
        }
        Ok(Self { bits })
    }

    /// Filter holding every action `compiled` grants
    pub fn build(compiled: &CompiledPermissions) -> Self {
        let mut filter = Self::new();
        for (resource_type, permission) in &compiled.resources {
            for op in permission.standard_ops.iter() {
                filter.insert(&Self::key(resource_type, op.as_str()));
            }
            for op in permission.extended_ops.iter() {
                filter.insert(&Self::key(resource_type, op));
            }
        }
        filter
    }

    /// `"resource:action"`
    pub fn key(resource_type: &str, action: &str) -> String {
        format!("{}:{}", resource_type, action)
    }

    pub fn insert(&mut self, key: &str) {
        if self.bits.is_empty() {
            return;
        }
        let bit_len = self.bits.len() * 8;
        for seed in 0..BLOOM_HASH_COUNT {
            let bit = Self::position(seed, key, bit_len);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False only when `key` was never inserted
    pub fn test(&self, key: &str) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        let bit_len = self.bits.len() * 8;
        (0..BLOOM_HASH_COUNT).all(|seed| {
            let bit = Self::position(seed, key, bit_len);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of set bits
    pub fn popcount(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    fn position(seed: u32, key: &str, bit_len: usize) -> usize {
        (fnv1a64_seeded(seed, key.as_bytes()) % bit_len as u64) as usize
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bytes", &self.bits.len())
            .field("set_bits", &self.popcount())
            .finish()
    }
}

impl Serialize for BloomFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.bits))
    }
}

impl<'de> Deserialize<'de> for BloomFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)?;
        BloomFilter::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}
