//! Resolves invalidation targets to cache keys and fans out evictions

use super::bus::InvalidationBus;
use super::event::{InvalidationEvent, InvalidationKind, InvalidationTarget};
use crate::cache::{CacheKey, PermissionCache, STORAGE_PREFIX};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::policy::{Policy, PolicyRepository, SubjectType};
use crate::roles::{RoleGraph, RoleRepository};
use crate::types::{OrganizationId, RoleId};
use crate::users::UserRepository;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How an invalidation is carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    /// Include descendant roles when resolving role-based targets
    pub cascade: bool,
    /// Parallel cache deletions
    pub max_concurrent: usize,
    /// Wait until every deletion settles
    pub wait_for_completion: bool,
    /// Publish an event for peer instances
    pub publish_event: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            cascade: true,
            max_concurrent: 10,
            wait_for_completion: true,
            publish_event: true,
        }
    }
}

/// Outcome of one invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    pub kind: InvalidationKind,
    /// Keys the target resolved to
    pub keys: usize,
    /// Keys removed from every tier; zero while deletions run in the background
    pub evicted: usize,
    pub failed: usize,
    pub published: bool,
    /// Deletions still running in the background
    pub pending: bool,
}

/// Cache invalidation at user, organization, business unit, policy, role and
/// global granularity
pub struct InvalidationCoordinator {
    cache: Arc<PermissionCache>,
    policies: Arc<dyn PolicyRepository>,
    roles: Arc<dyn RoleRepository>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<dyn InvalidationBus>>,
    channel: String,
    instance_id: String,
    default_max_concurrent: usize,
    background: TaskTracker,
}

impl InvalidationCoordinator {
    pub fn new(
        cache: Arc<PermissionCache>,
        policies: Arc<dyn PolicyRepository>,
        roles: Arc<dyn RoleRepository>,
        users: Arc<dyn UserRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            policies,
            roles,
            users,
            clock,
            bus: None,
            channel: super::INVALIDATION_CHANNEL.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            default_max_concurrent: Strategy::default().max_concurrent,
            background: TaskTracker::new(),
        }
    }

    /// Publish events on `channel` of `bus`
    pub fn with_bus(mut self, bus: Arc<dyn InvalidationBus>, channel: impl Into<String>) -> Self {
        self.bus = Some(bus);
        self.channel = channel.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_default_concurrency(mut self, max_concurrent: usize) -> Self {
        self.default_max_concurrent = max_concurrent;
        self
    }

    /// Id stamped on published events
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Default strategy with the configured concurrency
    pub fn default_strategy(&self) -> Strategy {
        Strategy {
            max_concurrent: self.default_max_concurrent,
            ..Strategy::default()
        }
    }

    /// Invalidate every cache entry `target` covers
    ///
    /// Local L1 entries are dropped before this returns, whatever the
    /// strategy. Shared-tier deletions follow `strategy.wait_for_completion`.
    ///
    /// # Errors
    ///
    /// Repository failures while resolving the target. Individual deletion
    /// failures are counted in the report and logged.
    pub async fn invalidate(
        &self,
        target: &InvalidationTarget,
        strategy: &Strategy,
        reason: &str,
    ) -> Result<InvalidationReport> {
        let keys = self.resolve(target, strategy.cascade).await?;
        self.execute(target, keys, strategy, reason).await
    }

    /// Invalidate after a policy was updated or deleted
    ///
    /// `previous` is the policy as it stood before the change. Holders of its
    /// old subjects and scope are covered along with those of the stored
    /// version, if one remains. Peers receive a plain policy event.
    pub async fn invalidate_policy_change(
        &self,
        previous: &Policy,
        strategy: &Strategy,
        reason: &str,
    ) -> Result<InvalidationReport> {
        let mut keys = BTreeSet::new();
        self.collect_policy(previous, strategy.cascade, &mut keys).await?;
        if let Some(current) = self.policies.get_policy(&previous.id).await? {
            self.collect_policy(&current, strategy.cascade, &mut keys).await?;
        }

        let target = InvalidationTarget::Policy(previous.id.clone());
        self.execute(&target, keys, strategy, reason).await
    }

    async fn execute(
        &self,
        target: &InvalidationTarget,
        keys: BTreeSet<CacheKey>,
        strategy: &Strategy,
        reason: &str,
    ) -> Result<InvalidationReport> {
        let keys: Vec<CacheKey> = keys.into_iter().collect();
        let key_count = keys.len();

        let (evicted, failed, pending) = if keys.is_empty() {
            (0, 0, false)
        } else if strategy.wait_for_completion {
            let (evicted, failed) = evict_all(self.cache.clone(), keys, strategy.max_concurrent).await;
            (evicted, failed, false)
        } else {
            let cache = self.cache.clone();
            let max_concurrent = strategy.max_concurrent;
            self.background.spawn(async move {
                let (evicted, failed) = evict_all(cache, keys, max_concurrent).await;
                debug!(evicted, failed, "background invalidation settled");
            });
            (0, 0, true)
        };

        let published = strategy.publish_event && self.publish(target, reason).await;

        info!(
            kind = ?target.kind(),
            keys = key_count,
            evicted,
            failed,
            published,
            reason,
            "cache invalidated"
        );

        Ok(InvalidationReport {
            kind: target.kind(),
            keys: key_count,
            evicted,
            failed,
            published,
            pending,
        })
    }

    /// Cache keys `target` covers
    ///
    /// User, organization and business unit targets include every cached pair
    /// in range, so a membership revoked before the call is still evicted. A
    /// policy that no longer exists resolves to every cached pair.
    pub async fn resolve(&self, target: &InvalidationTarget, cascade: bool) -> Result<BTreeSet<CacheKey>> {
        let mut keys = BTreeSet::new();

        match target {
            InvalidationTarget::User {
                user_id,
                organization_id: Some(organization_id),
            } => {
                keys.insert(CacheKey::new(user_id.as_str(), organization_id.as_str()));
            }
            InvalidationTarget::User {
                user_id,
                organization_id: None,
            } => {
                keys.extend(self.cache.cached_keys(Some(user_id.as_str()), None).await?);
                self.cache.evict_local_user(user_id);
                if let Some(user) = self.users.get_user(user_id).await? {
                    for organization_id in user.organization_ids() {
                        keys.insert(CacheKey::new(user_id.as_str(), organization_id));
                    }
                }
            }
            InvalidationTarget::Organization(organization_id) => {
                self.collect_organization(organization_id, &mut keys).await?;
            }
            InvalidationTarget::BusinessUnit(business_unit_id) => {
                for organization_id in self.users.organizations_in_business_unit(business_unit_id).await? {
                    self.collect_organization(&organization_id, &mut keys).await?;
                }
            }
            InvalidationTarget::Policy(policy_id) => match self.policies.get_policy(policy_id).await? {
                Some(policy) => self.collect_policy(&policy, cascade, &mut keys).await?,
                None => {
                    warn!(policy_id = %policy_id, "policy not found, invalidating every cached manifest");
                    keys.extend(self.cache.cached_keys(None, None).await?);
                    self.cache.flush_local();
                }
            },
            InvalidationTarget::Role(role_id) => {
                let family = self.role_family(role_id, cascade).await?;
                self.collect_role_holders(&family, None, &mut keys).await?;
            }
            InvalidationTarget::Global => {
                self.cache.delete_pattern(STORAGE_PREFIX);
            }
        }

        Ok(keys)
    }

    async fn collect_organization(&self, organization_id: &str, keys: &mut BTreeSet<CacheKey>) -> Result<()> {
        keys.extend(self.cache.cached_keys(None, Some(organization_id)).await?);
        self.cache.evict_local_organization(organization_id);
        for membership in self.users.memberships_in_organization(organization_id).await? {
            keys.insert(CacheKey::new(membership.user_id, organization_id));
        }
        Ok(())
    }

    async fn collect_policy(&self, policy: &Policy, cascade: bool, keys: &mut BTreeSet<CacheKey>) -> Result<()> {
        let business_unit_id = &policy.scope.business_unit_id;
        let organizations: Vec<OrganizationId> = if policy.scope.organization_ids.is_empty() {
            self.users.organizations_in_business_unit(business_unit_id).await?
        } else {
            policy.scope.organization_ids.clone()
        };

        // Group membership is not indexed; a group subject reaches everyone in scope
        let everyone = policy.subjects.is_empty()
            || policy.subjects.iter().any(|s| s.kind == SubjectType::Group);
        if everyone {
            for organization_id in &organizations {
                self.collect_organization(organization_id, keys).await?;
            }
            return Ok(());
        }

        let bu_roles = self.roles.roles_for_business_unit(business_unit_id).await?;
        let bundling: Vec<RoleId> = bu_roles
            .iter()
            .filter(|role| role.policy_ids.iter().any(|id| *id == policy.id))
            .map(|role| role.id.clone())
            .collect();
        let graph = RoleGraph::build(bu_roles)?;

        let mut family = BTreeSet::new();
        for role_id in bundling {
            if cascade {
                family.extend(graph.descendants(&role_id));
            }
            family.insert(role_id);
        }

        for subject in &policy.subjects {
            match subject.kind {
                SubjectType::User => {
                    if let Some(user) = self.users.get_user(&subject.id).await? {
                        for organization_id in user.organization_ids() {
                            if organizations.contains(&organization_id) {
                                keys.insert(CacheKey::new(subject.id.as_str(), organization_id));
                            }
                        }
                    }
                }
                SubjectType::Role => {
                    if cascade && graph.get(&subject.id).is_some() {
                        family.extend(graph.descendants(&subject.id));
                    }
                    family.insert(subject.id.clone());
                }
                SubjectType::Group => {}
            }
        }

        self.collect_role_holders(&family, Some(&organizations), keys).await
    }

    /// `role_id` plus, when cascading, every role inheriting from it
    async fn role_family(&self, role_id: &str, cascade: bool) -> Result<BTreeSet<RoleId>> {
        let mut family = BTreeSet::from([role_id.to_string()]);
        if cascade {
            if let Some(role) = self.roles.get_role(role_id).await? {
                let graph = RoleGraph::build(self.roles.roles_for_business_unit(&role.business_unit_id).await?)?;
                family.extend(graph.descendants(role_id));
            }
        }
        Ok(family)
    }

    async fn collect_role_holders(
        &self,
        roles: &BTreeSet<RoleId>,
        organizations: Option<&[OrganizationId]>,
        keys: &mut BTreeSet<CacheKey>,
    ) -> Result<()> {
        for role_id in roles {
            for membership in self.users.memberships_with_role(role_id).await? {
                if organizations.map_or(true, |orgs| orgs.contains(&membership.organization_id)) {
                    keys.insert(CacheKey::new(membership.user_id, membership.organization_id));
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, target: &InvalidationTarget, reason: &str) -> bool {
        let Some(bus) = &self.bus else {
            return false;
        };

        let event = InvalidationEvent::new(target, reason, self.clock.now()).with_source(self.instance_id.as_str());
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode invalidation event");
                return false;
            }
        };

        match bus.publish(&self.channel, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "failed to publish invalidation event");
                false
            }
        }
    }

    /// Wait for background deletions, up to `deadline`
    pub async fn drain(&self, deadline: Duration) -> Result<()> {
        self.background.close();
        let outcome = tokio::time::timeout(deadline, self.background.wait()).await;
        self.background.reopen();
        outcome.map_err(|_| AuthzError::Timeout("background invalidations still running".to_string()))
    }
}

/// Delete `keys` from every tier with at most `max_concurrent` in flight
async fn evict_all(cache: Arc<PermissionCache>, keys: Vec<CacheKey>, max_concurrent: usize) -> (usize, usize) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let deletions = keys.into_iter().map(|key| {
        let cache = cache.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await;
            match cache.delete(&key).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(user_id = %key.user_id, organization_id = %key.organization_id, error = %e, "cache delete failed");
                    false
                }
            }
        }
    });

    let outcomes = join_all(deletions).await;
    let evicted = outcomes.iter().filter(|ok| **ok).count();
    (evicted, outcomes.len() - evicted)
}
