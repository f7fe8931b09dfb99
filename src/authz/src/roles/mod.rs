//! Roles and role hierarchy
//!
//! A role bundles policy ids inside a business unit and may inherit from parent
//! roles. Roles are stored flat and reference parents by id; [`RoleGraph`]
//! validates the hierarchy and answers ancestor/descendant queries.

pub mod graph;

pub use graph::RoleGraph;

use crate::error::Result;
use crate::types::{BusinessUnitId, OrganizationId, PolicyId, RoleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleLevel {
    System,
    Organization,
    Custom,
    Temporary,
}

/// Named bundle of policies bound to a business unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub business_unit_id: BusinessUnitId,
    pub level: RoleLevel,
    /// Holders pass every check in the organizations this role covers
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,
    #[serde(default)]
    pub parent_roles: Vec<RoleId>,
    /// Empty means every organization in the business unit
    #[serde(default)]
    pub organization_ids: Vec<OrganizationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            business_unit_id: business_unit_id.into(),
            level: RoleLevel::Custom,
            is_admin: false,
            policy_ids: Vec::new(),
            parent_roles: Vec::new(),
            organization_ids: Vec::new(),
            expires_at: None,
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn with_level(mut self, level: RoleLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_policies(mut self, policy_ids: &[&str]) -> Self {
        self.policy_ids = policy_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parent_roles = parents.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn in_organizations(mut self, organization_ids: &[&str]) -> Self {
        self.organization_ids = organization_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Not past its expiry at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    pub fn covers_organization(&self, organization_id: &str) -> bool {
        self.organization_ids.is_empty() || self.organization_ids.iter().any(|o| o == organization_id)
    }
}

/// Role repository consumed by the engine
#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Whether any active role the user holds in the organization is administrative
    async fn has_admin_role(&self, user_id: &str, organization_id: &str) -> Result<bool>;

    async fn get_role(&self, id: &str) -> Result<Option<Role>>;

    /// Every role defined in the business unit
    async fn roles_for_business_unit(&self, business_unit_id: &str) -> Result<Vec<Role>>;
}
