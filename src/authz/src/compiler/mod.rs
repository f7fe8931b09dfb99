//! Policy compiler
//!
//! Collapses a priority-ordered list of raw policies into a per-user,
//! per-organization [`CompiledPermissions`]. Compilation is pure: the same
//! subject, policies and clock reading always give byte-identical output.
//!
//! # Pipeline
//!
//! ```text
//! policies → scope filter → subject filter → conditions
//!          → allows (union, widest scope) → denies (subtract) → quick-check
//! ```

pub mod conditions;
pub mod sets;

pub use conditions::ConditionOutcome;
pub use sets::{OpSet, SortedOps};

use crate::hash::quick_check;
use crate::manifest::{CompiledPermissions, ResourcePermission};
use crate::policy::{Policy, PolicyEffect, ResourceRule, SubjectType};
use crate::registry::ResourceRegistry;
use crate::types::{BusinessUnitId, DataScope, GroupId, OrganizationId, PolicyId, RoleId, StandardOp, UserId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the compiler needs to know about the subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectContext {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub business_unit_id: BusinessUnitId,
    /// Held roles in the organization, expanded through role ancestors
    pub roles: BTreeSet<RoleId>,
    pub groups: BTreeSet<GroupId>,
    /// Policies bundled by any of `roles`
    pub bundled_policies: BTreeSet<PolicyId>,
}

impl SubjectContext {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        business_unit_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            business_unit_id: business_unit_id.into(),
            ..Default::default()
        }
    }

    pub fn with_roles<S: Into<String>>(mut self, roles: impl IntoIterator<Item = S>) -> Self {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn with_bundled_policies<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.bundled_policies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Whether `policy` names this subject or is bundled by one of its roles
    pub fn is_subject_of(&self, policy: &Policy) -> bool {
        if policy.subjects.is_empty() || self.bundled_policies.contains(&policy.id) {
            return true;
        }
        policy.subjects.iter().any(|s| match s.kind {
            SubjectType::User => s.id == self.user_id,
            SubjectType::Role => self.roles.contains(&s.id),
            SubjectType::Group => self.groups.contains(&s.id),
        })
    }
}

/// Per-resource accumulator
#[derive(Default)]
struct Grant {
    standard: OpSet,
    extended: SortedOps,
    scope: Option<DataScope>,
}

/// Compiles policies against the resource registry
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    registry: Arc<ResourceRegistry>,
}

impl PolicyCompiler {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Compile `policies` for `subject` at `now`
    ///
    /// Policies need not be pre-filtered; out-of-scope and non-matching ones
    /// are dropped here. Unknown resources and operations are skipped with a
    /// warning carrying the policy id.
    pub fn compile(&self, subject: &SubjectContext, policies: &[Policy], now: DateTime<Utc>) -> CompiledPermissions {
        let mut ordered: Vec<&Policy> = policies.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut allows: Vec<(&Policy, bool)> = Vec::new();
        let mut denies: Vec<&Policy> = Vec::new();

        for policy in ordered {
            if !policy
                .scope
                .covers(&subject.business_unit_id, &subject.organization_id)
            {
                debug!(policy_id = %policy.id, "policy out of scope");
                continue;
            }
            if !subject.is_subject_of(policy) {
                continue;
            }
            if policy.resources.is_empty() {
                debug!(policy_id = %policy.id, "policy has no resources, ignoring");
                continue;
            }

            let own_only = match conditions::evaluate(policy, subject, now) {
                ConditionOutcome::Apply { own_only } => own_only,
                ConditionOutcome::Skip => continue,
            };

            match policy.effect {
                PolicyEffect::Allow => allows.push((policy, own_only)),
                PolicyEffect::Deny => denies.push(policy),
            }
        }

        let mut grants: BTreeMap<String, Grant> = BTreeMap::new();

        for (policy, own_only) in &allows {
            for rule in &policy.resources {
                let Some((standard, extended)) = self.resolve_actions(policy, rule) else {
                    continue;
                };
                if standard.is_empty() && extended.is_empty() {
                    continue;
                }

                let scope = if *own_only { DataScope::Own } else { rule.data_scope };
                let grant = grants.entry(rule.resource_type.clone()).or_default();
                grant.standard = grant.standard.union(standard);
                for op in extended.iter() {
                    grant.extended.insert(op);
                }
                grant.scope = Some(grant.scope.map_or(scope, |current| current.widest(scope)));
            }
        }

        for policy in &denies {
            for rule in &policy.resources {
                let Some(grant) = grants.get_mut(&rule.resource_type) else {
                    continue;
                };
                let Some((standard, extended)) = self.resolve_actions(policy, rule) else {
                    continue;
                };
                grant.standard = grant.standard.difference(standard);
                for op in extended.iter() {
                    grant.extended.remove(op);
                }
            }
        }

        let mut compiled = CompiledPermissions::default();
        for (resource_type, grant) in grants {
            if grant.standard.is_empty() && grant.extended.is_empty() {
                continue;
            }
            let data_scope = grant.scope.unwrap_or_default();
            compiled.data_scopes.insert(resource_type.clone(), data_scope);
            compiled.resources.insert(
                resource_type,
                ResourcePermission {
                    quick_check: quick_check(grant.standard.bits(), grant.extended.len()),
                    standard_ops: grant.standard,
                    extended_ops: grant.extended,
                    data_scope,
                },
            );
        }

        debug!(
            user_id = %subject.user_id,
            organization_id = %subject.organization_id,
            allows = allows.len(),
            denies = denies.len(),
            resources = compiled.resources.len(),
            "compiled permissions"
        );

        compiled
    }

    /// Validate one rule against the registry, expanding composites
    fn resolve_actions(&self, policy: &Policy, rule: &ResourceRule) -> Option<(OpSet, SortedOps)> {
        let Some(record) = self.registry.get_resource(&rule.resource_type) else {
            warn!(
                policy_id = %policy.id,
                resource_type = %rule.resource_type,
                "policy references unknown resource, skipping entry"
            );
            return None;
        };

        let mut standard = rule.actions.standard;
        let unsupported = standard.difference(record.supported);
        if !unsupported.is_empty() {
            warn!(
                policy_id = %policy.id,
                resource_type = %rule.resource_type,
                bits = unsupported.bits(),
                "dropping unsupported standard operations"
            );
            standard = standard.intersection(record.supported);
        }

        let mut extended = SortedOps::new();
        for name in &rule.actions.extended {
            if record.extended.contains(name) {
                extended.insert(name.as_str());
            } else if let Some(bits) = record.composites.get(name) {
                standard = standard.union(*bits);
            } else if let Some(op) = StandardOp::parse(name).filter(|op| record.supported.contains(*op)) {
                standard.insert(op);
            } else {
                warn!(
                    policy_id = %policy.id,
                    resource_type = %rule.resource_type,
                    operation = %name,
                    "dropping unknown extended operation"
                );
            }
        }

        Some((standard, extended))
    }
}
