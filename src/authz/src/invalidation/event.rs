//! Invalidation targets and their pub/sub wire format

use crate::types::{BusinessUnitId, OrganizationId, PolicyId, RoleId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Granularity of an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    User,
    Organization,
    BusinessUnit,
    Policy,
    Role,
    Global,
}

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// One user, in one organization or (`None`) in all of them
    User {
        user_id: UserId,
        organization_id: Option<OrganizationId>,
    },
    Organization(OrganizationId),
    BusinessUnit(BusinessUnitId),
    Policy(PolicyId),
    Role(RoleId),
    Global,
}

impl InvalidationTarget {
    pub fn user(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
            organization_id: Some(organization_id.into()),
        }
    }

    pub fn user_everywhere(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
            organization_id: None,
        }
    }

    pub fn kind(&self) -> InvalidationKind {
        match self {
            Self::User { .. } => InvalidationKind::User,
            Self::Organization(_) => InvalidationKind::Organization,
            Self::BusinessUnit(_) => InvalidationKind::BusinessUnit,
            Self::Policy(_) => InvalidationKind::Policy,
            Self::Role(_) => InvalidationKind::Role,
            Self::Global => InvalidationKind::Global,
        }
    }
}

/// Message published on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_unit_id: Option<BusinessUnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<RoleId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    /// Publishing engine instance; receivers skip their own events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InvalidationEvent {
    pub fn new(target: &InvalidationTarget, reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let mut event = Self {
            kind: target.kind(),
            user_id: None,
            organization_id: None,
            business_unit_id: None,
            policy_id: None,
            role_id: None,
            timestamp,
            reason: reason.into(),
            source: None,
        };
        match target {
            InvalidationTarget::User { user_id, organization_id } => {
                event.user_id = Some(user_id.clone());
                event.organization_id = organization_id.clone();
            }
            InvalidationTarget::Organization(id) => event.organization_id = Some(id.clone()),
            InvalidationTarget::BusinessUnit(id) => event.business_unit_id = Some(id.clone()),
            InvalidationTarget::Policy(id) => event.policy_id = Some(id.clone()),
            InvalidationTarget::Role(id) => event.role_id = Some(id.clone()),
            InvalidationTarget::Global => {}
        }
        event
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
