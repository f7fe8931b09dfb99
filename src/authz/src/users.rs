//! Users and organization memberships

use crate::error::Result;
use crate::types::{BusinessUnitId, GroupId, OrganizationId, RoleId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's membership in one organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationMembership {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub business_unit_id: BusinessUnitId,
    #[serde(default)]
    pub role_ids: Vec<RoleId>,
    pub granted_by: UserId,
    /// An expired membership is equivalent to no membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OrganizationMembership {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        business_unit_id: impl Into<String>,
        role_ids: &[&str],
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            business_unit_id: business_unit_id.into(),
            role_ids: role_ids.iter().map(|s| s.to_string()).collect(),
            granted_by: "system".to_string(),
            expires_at: None,
        }
    }

    pub fn granted_by(mut self, user_id: impl Into<String>) -> Self {
        self.granted_by = user_id.into();
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// User with its memberships
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub business_unit_id: BusinessUnitId,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub memberships: Vec<OrganizationMembership>,
}

impl User {
    pub fn new(id: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            business_unit_id: business_unit_id.into(),
            group_ids: Vec::new(),
            memberships: Vec::new(),
        }
    }

    pub fn in_groups(mut self, groups: &[&str]) -> Self {
        self.group_ids = groups.iter().map(|s| s.to_string()).collect();
        self
    }

    /// The membership in `organization_id` if it exists and has not expired
    pub fn active_membership(&self, organization_id: &str, now: DateTime<Utc>) -> Option<&OrganizationMembership> {
        self.memberships
            .iter()
            .find(|m| m.organization_id == organization_id && m.is_active(now))
    }

    /// Organizations of every membership, de-duplicated in first-seen order
    pub fn organization_ids(&self) -> Vec<OrganizationId> {
        let mut orgs: Vec<OrganizationId> = Vec::with_capacity(self.memberships.len());
        for membership in &self.memberships {
            if !orgs.contains(&membership.organization_id) {
                orgs.push(membership.organization_id.clone());
            }
        }
        orgs
    }
}

/// User and tenancy repository consumed by the engine
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// User with all memberships
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    async fn memberships_in_organization(&self, organization_id: &str) -> Result<Vec<OrganizationMembership>>;

    async fn memberships_with_role(&self, role_id: &str) -> Result<Vec<OrganizationMembership>>;

    async fn organizations_in_business_unit(&self, business_unit_id: &str) -> Result<Vec<OrganizationId>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expired_membership_is_inactive() {
        let now = Utc::now();
        let mut user = User::new("user-1", "bu-1");
        user.memberships.push(
            OrganizationMembership::new("user-1", "org-1", "bu-1", &["viewer"])
                .expiring_at(now - Duration::seconds(1)),
        );
        user.memberships
            .push(OrganizationMembership::new("user-1", "org-2", "bu-1", &["viewer"]));

        assert!(user.active_membership("org-1", now).is_none());
        assert!(user.active_membership("org-2", now).is_some());
        assert_eq!(user.organization_ids(), vec!["org-1", "org-2"]);
    }
}
