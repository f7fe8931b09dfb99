//! Compiled permission sets and their cache envelopes

use crate::bloom::BloomFilter;
use crate::compiler::sets::{OpSet, SortedOps};
use crate::error::{AuthzError, Result};
use crate::types::{DataScope, OrganizationId, ResourceType, StandardOp, UserId};
use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Effective permissions on one resource type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePermission {
    pub standard_ops: OpSet,
    #[serde(default)]
    pub extended_ops: SortedOps,
    #[serde(default)]
    pub data_scope: DataScope,
    /// FNV-1a of `(standard_ops, extended_ops.len())`
    #[serde(default)]
    pub quick_check: u64,
}

impl ResourcePermission {
    pub fn is_empty(&self) -> bool {
        self.standard_ops.is_empty() && self.extended_ops.is_empty()
    }

    /// Whether `action` is granted, as a standard name or an extended op
    pub fn allows(&self, action: &str) -> bool {
        match StandardOp::parse(action) {
            Some(op) => self.standard_ops.contains(op),
            None => self.extended_ops.contains(action),
        }
    }
}

/// Product of compiling one user's policies in one organization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPermissions {
    /// Ordered by resource type so serialisation is canonical
    pub resources: BTreeMap<ResourceType, ResourcePermission>,
    /// Reserved, always 0
    #[serde(default)]
    pub global_flags: u64,
    #[serde(default)]
    pub data_scopes: BTreeMap<ResourceType, DataScope>,
}

impl CompiledPermissions {
    pub fn get(&self, resource_type: &str) -> Option<&ResourcePermission> {
        self.resources.get(resource_type)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn allows(&self, resource_type: &str, action: &str) -> bool {
        self.get(resource_type)
            .map(|p| p.allows(action))
            .unwrap_or(false)
    }

    /// Lowercase hex SHA-256 of the canonical JSON of `resources`
    pub fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(&self.resources)?;
        let hash = digest::digest(&digest::SHA256, &canonical);
        Ok(hex::encode(hash.as_ref()))
    }
}

/// Envelope handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionManifest {
    pub version: String,
    pub user_id: UserId,
    pub current_organization: OrganizationId,
    pub available_organizations: Vec<OrganizationId>,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub permissions: CompiledPermissions,
    pub bloom_filter: BloomFilter,
    pub checksum: String,
}

impl PermissionManifest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Persisted form; user and organization live in the storage key
    pub fn to_cached(&self) -> CachedPermissions {
        CachedPermissions {
            version: self.version.clone(),
            computed_at: self.computed_at,
            expires_at: self.expires_at,
            permissions: CompiledPermissions {
                resources: self.permissions.resources.clone(),
                global_flags: 0,
                data_scopes: BTreeMap::new(),
            },
            bloom_filter: self.bloom_filter.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

/// Value stored at L2 and L3
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPermissions {
    pub version: String,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub permissions: CompiledPermissions,
    pub bloom_filter: BloomFilter,
    pub checksum: String,
}

impl CachedPermissions {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Rebuild a manifest. Available organizations default to `[organization_id]`.
    pub fn into_manifest(self, user_id: &str, organization_id: &str) -> PermissionManifest {
        PermissionManifest {
            version: self.version,
            user_id: user_id.to_string(),
            current_organization: organization_id.to_string(),
            available_organizations: vec![organization_id.to_string()],
            computed_at: self.computed_at,
            expires_at: self.expires_at,
            permissions: self.permissions,
            bloom_filter: self.bloom_filter,
            checksum: self.checksum,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| AuthzError::Serialization(format!("cached permissions: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> CompiledPermissions {
        let mut compiled = CompiledPermissions::default();
        compiled.resources.insert(
            "shipment".into(),
            ResourcePermission {
                standard_ops: OpSet::of(&[StandardOp::Read, StandardOp::Update]),
                extended_ops: SortedOps::from(vec!["split".to_string()]),
                data_scope: DataScope::Organization,
                quick_check: 7,
            },
        );
        compiled
    }

    #[test]
    fn test_allows_standard_and_extended() {
        let compiled = sample();
        assert!(compiled.allows("shipment", "read"));
        assert!(compiled.allows("shipment", "split"));
        assert!(!compiled.allows("shipment", "delete"));
        assert!(!compiled.allows("invoice", "read"));
    }

    #[test]
    fn test_checksum_is_stable_hex_sha256() {
        let a = sample().checksum().unwrap();
        let b = sample().checksum().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let empty = CompiledPermissions::default().checksum().unwrap();
        assert_ne!(a, empty);
    }

    #[test]
    fn test_cached_wire_format() {
        let now = Utc::now();
        let cached = CachedPermissions {
            version: "v3.0".into(),
            computed_at: now,
            expires_at: now + Duration::minutes(30),
            permissions: sample(),
            bloom_filter: BloomFilter::new(),
            checksum: "abc".into(),
        };

        let value: serde_json::Value = serde_json::from_slice(&cached.encode().unwrap()).unwrap();
        assert_eq!(value["version"], "v3.0");
        assert_eq!(value["globalFlags"], 0);
        assert_eq!(value["resources"]["shipment"]["standardOps"], 0x06);
        assert_eq!(value["resources"]["shipment"]["extendedOps"][0], "split");
        assert_eq!(value["resources"]["shipment"]["dataScope"], "organization");
        assert!(value["bloomFilter"].is_string());
        assert!(value.get("userId").is_none());

        let decoded = CachedPermissions::decode(&cached.encode().unwrap()).unwrap();
        assert_eq!(decoded, cached);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let cached = CachedPermissions {
            version: "v3.0".into(),
            computed_at: now - Duration::minutes(30),
            expires_at: now,
            permissions: CompiledPermissions::default(),
            bloom_filter: BloomFilter::empty(),
            checksum: String::new(),
        };
        assert!(cached.is_expired(now));
        assert!(!cached.is_expired(now - Duration::milliseconds(1)));

        let manifest = cached.into_manifest("user-1", "org-1");
        assert_eq!(manifest.available_organizations, vec!["org-1"]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            CachedPermissions::decode(b"not json"),
            Err(AuthzError::Serialization(_))
        ));
    }
}
