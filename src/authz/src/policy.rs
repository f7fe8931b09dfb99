//! Policy definition and storage

use crate::compiler::sets::OpSet;
use crate::error::Result;
use crate::types::{BusinessUnitId, DataScope, OrganizationId, PolicyId, ResourceType, StandardOp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Policy effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyEffect {
    /// Grant the listed actions
    Allow,
    /// Remove the listed actions
    Deny,
}

/// Kind of entity a policy subject names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Role,
    Group,
}

/// Typed subject reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub kind: SubjectType,
    pub id: String,
}

impl Subject {
    pub fn user(id: impl Into<String>) -> Self {
        Self { kind: SubjectType::User, id: id.into() }
    }

    pub fn role(id: impl Into<String>) -> Self {
        Self { kind: SubjectType::Role, id: id.into() }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self { kind: SubjectType::Group, id: id.into() }
    }
}

/// Tenancy scope of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyScope {
    pub business_unit_id: BusinessUnitId,
    /// Empty means every organization in the business unit
    #[serde(default)]
    pub organization_ids: Vec<OrganizationId>,
}

impl PolicyScope {
    pub fn covers(&self, business_unit_id: &str, organization_id: &str) -> bool {
        self.business_unit_id == business_unit_id
            && (self.organization_ids.is_empty()
                || self.organization_ids.iter().any(|o| o == organization_id))
    }
}

/// Actions granted or removed on one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSet {
    pub standard: OpSet,
    /// Extended operation names; composite names expand at compile time
    #[serde(default)]
    pub extended: Vec<String>,
}

impl ActionSet {
    pub fn standard(ops: &[StandardOp]) -> Self {
        Self {
            standard: OpSet::of(ops),
            extended: Vec::new(),
        }
    }

    pub fn extended(ops: &[&str]) -> Self {
        Self {
            standard: OpSet::EMPTY,
            extended: ops.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.standard.is_empty() && self.extended.is_empty()
    }
}

/// One `(resource_type, action_set, data_scope)` entry of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub resource_type: ResourceType,
    pub actions: ActionSet,
    #[serde(default)]
    pub data_scope: DataScope,
}

/// Subject attribute a field condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectField {
    UserId,
    OrganizationId,
    BusinessUnitId,
}

/// Comparison used by a field condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperator {
    Eq,
    Neq,
    In,
    NotIn,
}

/// Sealed set of policy conditions, evaluated when the policy is compiled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a subject attribute against literal values
    Field {
        field: SubjectField,
        operator: FieldOperator,
        values: Vec<String>,
    },
    /// Active only inside the window (either bound optional)
    Time {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_before: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_after: Option<DateTime<Utc>>,
    },
    /// Subject must hold at least one of the roles in the target organization
    Role { role_ids: Vec<String> },
    /// Grant applies to the subject's own records only
    Ownership,
    /// Free-form expression; has no defined semantics
    Custom { expression: String },
}

/// Policy definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// Policy name
    pub name: String,

    /// Policy priority (higher = applied first)
    #[serde(default)]
    pub priority: i32,

    /// Policy effect (allow or deny)
    pub effect: PolicyEffect,

    /// Empty applies to everyone in scope
    #[serde(default)]
    pub subjects: Vec<Subject>,

    pub scope: PolicyScope,

    pub resources: Vec<ResourceRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Policy {
    fn with_effect(
        effect: PolicyEffect,
        id: impl Into<String>,
        name: impl Into<String>,
        business_unit_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority: 0,
            effect,
            subjects: Vec::new(),
            scope: PolicyScope {
                business_unit_id: business_unit_id.into(),
                organization_ids: Vec::new(),
            },
            resources: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Allow policy covering the whole business unit
    pub fn allow(id: impl Into<String>, name: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self::with_effect(PolicyEffect::Allow, id, name, business_unit_id)
    }

    /// Deny policy covering the whole business unit
    pub fn deny(id: impl Into<String>, name: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self::with_effect(PolicyEffect::Deny, id, name, business_unit_id)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_subject(mut self, subject: Subject) -> Self {
        self.subjects.push(subject);
        self
    }

    pub fn in_organizations(mut self, organization_ids: &[&str]) -> Self {
        self.scope.organization_ids = organization_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on(mut self, resource_type: impl Into<String>, actions: ActionSet, data_scope: DataScope) -> Self {
        self.resources.push(ResourceRule {
            resource_type: resource_type.into(),
            actions,
            data_scope,
        });
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether any subject of `kind` has id `id`
    pub fn names_subject(&self, kind: SubjectType, id: &str) -> bool {
        self.subjects.iter().any(|s| s.kind == kind && s.id == id)
    }
}

/// Policy repository consumed by the engine
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Candidate policies for a user in an organization, priority-descending.
    ///
    /// Implementations may return policies the user is not subject to; the
    /// compiler applies scope and subject filtering itself.
    async fn user_policies(&self, user_id: &str, organization_id: &str) -> Result<Vec<Policy>>;

    /// Get a policy by ID
    async fn get_policy(&self, id: &str) -> Result<Option<Policy>>;
}

/// In-memory policy store implementation
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<PolicyId, Policy>>>,
}

impl InMemoryPolicyStore {
    /// Create a new in-memory policy store
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store or replace a policy
    pub async fn put(&self, policy: Policy) {
        let mut policies = self.policies.write().await;
        policies.insert(policy.id.clone(), policy);
    }

    /// Delete a policy, returning it when present
    pub async fn delete(&self, id: &str) -> Option<Policy> {
        let mut policies = self.policies.write().await;
        policies.remove(id)
    }

    /// List all policies, priority-descending
    pub async fn list(&self) -> Vec<Policy> {
        let policies = self.policies.read().await;
        let mut all: Vec<Policy> = policies.values().cloned().collect();
        sort_by_priority(&mut all);
        all
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyStore {
    async fn user_policies(&self, _user_id: &str, _organization_id: &str) -> Result<Vec<Policy>> {
        Ok(self.list().await)
    }

    async fn get_policy(&self, id: &str) -> Result<Option<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies.get(id).cloned())
    }
}

/// Priority descending, ties by id so the order is reproducible
pub fn sort_by_priority(policies: &mut [Policy]) {
    policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}
