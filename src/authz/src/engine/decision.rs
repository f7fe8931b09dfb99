//! Check requests and results

use crate::types::{DataScope, OrganizationId, ResourceType, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Single permission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub resource_type: ResourceType,
    /// Standard operation name or extended operation
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Caller-supplied attributes, carried for logging
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Minimum data scope the caller needs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<DataScope>,
}

impl CheckRequest {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        resource_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            resource_type: resource_type.into(),
            action: action.into(),
            resource_id: None,
            context: HashMap::new(),
            data_scope: None,
        }
    }

    pub fn on_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn requiring_scope(mut self, scope: DataScope) -> Self {
        self.data_scope = Some(scope);
        self
    }

    pub(crate) fn as_resource_check(&self) -> ResourceCheck {
        ResourceCheck {
            resource_type: self.resource_type.clone(),
            action: self.action.clone(),
            resource_id: self.resource_id.clone(),
            data_scope: self.data_scope,
        }
    }
}

/// Outcome of a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: String,
    /// Manifest came from a cache tier
    pub cache_hit: bool,
    /// Elapsed wall time, microseconds expressed as milliseconds
    pub compute_time_ms: f64,
    /// Granted scope on the resource when allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<DataScope>,
}

impl CheckResult {
    pub(crate) fn allow(reason: impl Into<String>, data_scope: Option<DataScope>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            cache_hit: false,
            compute_time_ms: 0.0,
            data_scope,
        }
    }

    pub(crate) fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            cache_hit: false,
            compute_time_ms: 0.0,
            data_scope: None,
        }
    }

    pub(crate) fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub(crate) fn with_time(mut self, compute_time_ms: f64) -> Self {
        self.compute_time_ms = compute_time_ms;
        self
    }
}

/// One entry of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCheck {
    pub resource_type: ResourceType,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<DataScope>,
}

impl ResourceCheck {
    pub fn new(resource_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            action: action.into(),
            resource_id: None,
            data_scope: None,
        }
    }

    pub fn requiring_scope(mut self, scope: DataScope) -> Self {
        self.data_scope = Some(scope);
        self
    }
}

/// Many checks for one subject against a single manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckRequest {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub checks: Vec<ResourceCheck>,
}

impl BatchCheckRequest {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>, checks: Vec<ResourceCheck>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            checks,
        }
    }
}

/// Results in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckResult {
    pub results: Vec<CheckResult>,
    /// 1.0 when the manifest was cached, else 0.0
    pub cache_hit_rate: f64,
    pub total_time_ms: f64,
}

/// Decision reasons
pub(crate) mod reason {
    use crate::types::DataScope;

    pub const ADMIN: &str = "user has admin role";
    pub const ALLOWED: &str = "allowed";
    pub const BLOOM_MISS: &str = "permission not found in bloom filter";

    pub fn not_registered(resource_type: &str) -> String {
        format!("resource {} not registered", resource_type)
    }

    pub fn no_permissions(resource_type: &str) -> String {
        format!("no permissions for resource {}", resource_type)
    }

    pub fn action_not_allowed(action: &str, resource_type: &str) -> String {
        format!("action {} not allowed on resource {}", action, resource_type)
    }

    pub fn scope_too_narrow(requested: DataScope, granted: DataScope) -> String {
        format!("requested data scope {} exceeds granted {}", requested, granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_request_builder() {
        let request = CheckRequest::new("u-1", "o-1", "shipment", "read")
            .on_resource("shp-42")
            .with_context("ip", serde_json::json!("10.0.0.1"))
            .requiring_scope(DataScope::Organization);

        assert_eq!(request.resource_id.as_deref(), Some("shp-42"));
        assert_eq!(request.context.len(), 1);

        let check = request.as_resource_check();
        assert_eq!(check.resource_type, "shipment");
        assert_eq!(check.data_scope, Some(DataScope::Organization));
    }

    #[test]
    fn test_result_constructors() {
        let allowed = CheckResult::allow(reason::ALLOWED, Some(DataScope::All))
            .with_cache_hit(true)
            .with_time(0.012);
        assert!(allowed.allowed);
        assert!(allowed.cache_hit);
        assert_eq!(allowed.data_scope, Some(DataScope::All));

        let denied = CheckResult::deny(reason::not_registered("spaceship"));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, "resource spaceship not registered");
        assert_eq!(denied.data_scope, None);
    }

    #[test]
    fn test_reason_wording() {
        assert_eq!(
            reason::action_not_allowed("delete", "invoice"),
            "action delete not allowed on resource invoice"
        );
        assert_eq!(reason::no_permissions("invoice"), "no permissions for resource invoice");
    }
}
