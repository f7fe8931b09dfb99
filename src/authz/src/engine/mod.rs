//! Permission engine
//!
//! Answers "may this user perform this action on this resource type in this
//! organization" from a per-user compiled manifest, cached across three tiers.
//!
//! # Architecture
//!
//! ```text
//! check → admin short-circuit ─yes→ allow
//!           ↓ no
//!         fetch manifest: PermissionCache (L1 → L2 → L3)
//!           ↓ miss
//!         subject context → PolicyCompiler → BloomFilter → checksum
//!           ↓                                   ↓
//!         warm L1                          CacheWorkerPool → L2 + L3
//!           ↓
//!         registry → bloom → bitfield / extended ops → data scope → result
//! ```

pub mod decision;
pub mod metrics;

pub use decision::{BatchCheckRequest, BatchCheckResult, CheckRequest, CheckResult, ResourceCheck};
pub use metrics::{EngineMetrics, MetricsCollector};

use crate::bloom::BloomFilter;
use crate::cache::{
    CacheKey, CacheStats, DurableStore, InMemoryDurableStore, InMemoryKeyValueStore, KeyValueStore, PermissionCache,
};
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::compiler::{PolicyCompiler, SubjectContext};
use crate::config::EngineConfig;
use crate::error::{AuthzError, Result};
use crate::invalidation::{
    run_listener, InvalidationBus, InvalidationCoordinator, InvalidationReport, InvalidationTarget, Strategy,
};
use crate::manifest::{CompiledPermissions, PermissionManifest};
use crate::policy::{Policy, PolicyRepository};
use crate::registry::ResourceRegistry;
use crate::roles::{RoleGraph, RoleRepository};
use crate::types::{DataScope, OrganizationId, RoleId};
use crate::users::{User, UserRepository};
use crate::worker::{CacheJob, CacheWorkerPool, WorkerStats};
use chrono::{DateTime, Utc};
use decision::reason;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// External systems the engine reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub users: Arc<dyn UserRepository>,
    /// L2
    pub shared_cache: Arc<dyn KeyValueStore>,
    /// L3
    pub durable_cache: Arc<dyn DurableStore>,
    /// Cross-process invalidation; `None` for a single instance
    pub bus: Option<Arc<dyn InvalidationBus>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Repositories with in-memory L2/L3 and the system clock
    pub fn new(
        policies: Arc<dyn PolicyRepository>,
        roles: Arc<dyn RoleRepository>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        Self::with_clock(policies, roles, users, Arc::new(SystemClock))
    }

    /// Repositories with in-memory L2/L3 driven by `clock`
    pub fn with_clock(
        policies: Arc<dyn PolicyRepository>,
        roles: Arc<dyn RoleRepository>,
        users: Arc<dyn UserRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            roles,
            users,
            shared_cache: Arc::new(InMemoryKeyValueStore::new(clock.clone())),
            durable_cache: Arc::new(InMemoryDurableStore::new()),
            bus: None,
            clock,
        }
    }

    pub fn with_caches(mut self, shared: Arc<dyn KeyValueStore>, durable: Arc<dyn DurableStore>) -> Self {
        self.shared_cache = shared;
        self.durable_cache = durable;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

/// Permission engine façade
///
/// Safe to share across tasks. Every public operation takes a
/// [`CancellationToken`]; a cancelled token ends the operation with
/// [`AuthzError::Cancelled`].
pub struct PermissionEngine {
    config: EngineConfig,
    registry: Arc<ResourceRegistry>,
    compiler: PolicyCompiler,
    policies: Arc<dyn PolicyRepository>,
    roles: Arc<dyn RoleRepository>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    cache: Arc<PermissionCache>,
    workers: CacheWorkerPool,
    invalidator: InvalidationCoordinator,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown: CancellationToken,
    background: TaskTracker,
}

impl PermissionEngine {
    /// Wire collaborators and start the worker pool, the L1 sweeper and,
    /// when a bus is present, the invalidation listener
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for an invalid configuration; bus subscription
    /// failures are returned as-is.
    pub async fn new(
        config: EngineConfig,
        registry: Arc<ResourceRegistry>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            policies,
            roles,
            users,
            shared_cache,
            durable_cache,
            bus,
            clock,
        } = collaborators;

        let cache = Arc::new(PermissionCache::new(
            config.cache.clone(),
            config.version.clone(),
            shared_cache,
            durable_cache,
            clock.clone(),
        ));

        let mut invalidator = InvalidationCoordinator::new(
            cache.clone(),
            policies.clone(),
            roles.clone(),
            users.clone(),
            clock.clone(),
        )
        .with_default_concurrency(config.invalidation.max_concurrent);
        if let Some(bus) = &bus {
            invalidator = invalidator.with_bus(bus.clone(), config.invalidation.channel.clone());
        }

        let shutdown = CancellationToken::new();
        let background = TaskTracker::new();

        background.spawn(run_sweeper(
            cache.clone(),
            config.cache.l1_sweep_interval,
            shutdown.clone(),
        ));

        if let (Some(bus), true) = (&bus, config.invalidation.listen) {
            let events = bus.subscribe(&config.invalidation.channel).await?;
            background.spawn(run_listener(
                events,
                cache.clone(),
                invalidator.instance_id().to_string(),
                shutdown.clone(),
            ));
        }
        background.close();

        let workers = CacheWorkerPool::start(config.worker.clone(), cache.clone());

        let metrics = config.enable_metrics.then(|| Arc::new(MetricsCollector::new()));

        info!(
            version = %config.version,
            instance_id = %invalidator.instance_id(),
            resources = registry.len(),
            listening = bus.is_some() && config.invalidation.listen,
            "permission engine started"
        );

        Ok(Self {
            compiler: PolicyCompiler::new(registry.clone()),
            config,
            registry,
            policies,
            roles,
            users,
            clock,
            cache,
            workers,
            invalidator,
            metrics,
            shutdown,
            background,
        })
    }

    /// Decide a single check
    ///
    /// # Errors
    ///
    /// Role, user and policy repository failures, and cancellation. An
    /// unknown resource or action is a denial, not an error.
    pub async fn check(&self, request: &CheckRequest, cancel: &CancellationToken) -> Result<CheckResult> {
        let start = Instant::now();
        let outcome = cancellable(cancel, self.check_inner(request)).await;

        match outcome {
            Ok(result) => {
                let result = result.with_time(elapsed_ms(start));
                debug!(
                    user_id = %request.user_id,
                    organization_id = %request.organization_id,
                    resource_type = %request.resource_type,
                    action = %request.action,
                    resource_id = request.resource_id.as_deref().unwrap_or(""),
                    allowed = result.allowed,
                    cache_hit = result.cache_hit,
                    reason = %result.reason,
                    "permission check"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_decision(result.allowed).await;
                    metrics.record_latency(start.elapsed()).await;
                }
                Ok(result)
            }
            Err(e) => {
                warn!(
                    user_id = %request.user_id,
                    organization_id = %request.organization_id,
                    resource_type = %request.resource_type,
                    error = %e,
                    "permission check failed"
                );
                self.record_error().await;
                Err(e)
            }
        }
    }

    async fn check_inner(&self, request: &CheckRequest) -> Result<CheckResult> {
        if self.is_admin(&request.user_id, &request.organization_id, 1).await? {
            return Ok(CheckResult::allow(reason::ADMIN, Some(DataScope::All)));
        }

        let (manifest, cache_hit) = self.fetch_manifest(&request.user_id, &request.organization_id).await?;
        Ok(self
            .evaluate(&manifest, &request.as_resource_check())
            .with_cache_hit(cache_hit))
    }

    /// Decide many checks for one subject against a single manifest
    pub async fn check_batch(
        &self,
        request: &BatchCheckRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchCheckResult> {
        let start = Instant::now();
        let outcome = cancellable(cancel, self.batch_inner(request, start)).await;

        match outcome {
            Ok((results, cache_hit)) => {
                if let Some(metrics) = &self.metrics {
                    for result in &results {
                        metrics.record_decision(result.allowed).await;
                    }
                    metrics.record_latency(start.elapsed()).await;
                }
                let total_time_ms = elapsed_ms(start);
                debug!(
                    user_id = %request.user_id,
                    organization_id = %request.organization_id,
                    checks = results.len(),
                    allowed = results.iter().filter(|r| r.allowed).count(),
                    cache_hit,
                    total_time_ms,
                    "batch permission check"
                );
                Ok(BatchCheckResult {
                    results,
                    cache_hit_rate: if cache_hit { 1.0 } else { 0.0 },
                    total_time_ms,
                })
            }
            Err(e) => {
                warn!(user_id = %request.user_id, organization_id = %request.organization_id, error = %e, "batch check failed");
                self.record_error().await;
                Err(e)
            }
        }
    }

    async fn batch_inner(&self, request: &BatchCheckRequest, start: Instant) -> Result<(Vec<CheckResult>, bool)> {
        let checks = request.checks.len() as u64;
        if self.is_admin(&request.user_id, &request.organization_id, checks).await? {
            let results = request
                .checks
                .iter()
                .map(|_| CheckResult::allow(reason::ADMIN, Some(DataScope::All)).with_time(elapsed_ms(start)))
                .collect();
            return Ok((results, false));
        }

        let (manifest, cache_hit) = self.fetch_manifest(&request.user_id, &request.organization_id).await?;
        let results = request
            .checks
            .iter()
            .map(|check| {
                self.evaluate(&manifest, check)
                    .with_cache_hit(cache_hit)
                    .with_time(elapsed_ms(start))
            })
            .collect();
        Ok((results, cache_hit))
    }

    /// Manifest for a user in an organization, for permission-aware UIs
    pub async fn get_user_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PermissionManifest> {
        let (manifest, _) = cancellable(cancel, self.fetch_manifest(user_id, organization_id)).await?;
        Ok(manifest.as_ref().clone())
    }

    /// Recompute a manifest, bypassing the cache, and re-warm every tier
    ///
    /// The L3 row is kept until the worker overwrites it.
    pub async fn refresh_user_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PermissionManifest> {
        let key = CacheKey::new(user_id, organization_id);
        cancellable(cancel, async {
            self.cache.evict_hot(&key).await;
            let generation = self.cache.generation();
            let manifest = self.compute(user_id, organization_id).await?;
            self.store(key.clone(), manifest.clone(), generation).await;
            info!(user_id, organization_id, "permissions refreshed");
            Ok(manifest.as_ref().clone())
        })
        .await
    }

    /// Invalidate one user's cached manifest in one organization
    pub async fn invalidate_cache(
        &self,
        user_id: &str,
        organization_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InvalidationReport> {
        let target = InvalidationTarget::user(user_id, organization_id);
        let strategy = self.invalidator.default_strategy();
        self.invalidate(&target, &strategy, "explicit invalidation", cancel)
            .await
    }

    /// Invalidate at any granularity
    pub async fn invalidate(
        &self,
        target: &InvalidationTarget,
        strategy: &Strategy,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<InvalidationReport> {
        let outcome = cancellable(cancel, self.invalidator.invalidate(target, strategy, reason)).await;
        if outcome.is_err() {
            self.record_error().await;
        }
        outcome
    }

    /// Invalidate after updating or deleting a policy
    ///
    /// Pass the policy as it was before the change so that users who lose it
    /// are covered, not only those the stored version still reaches.
    pub async fn invalidate_policy_change(
        &self,
        previous: &Policy,
        strategy: &Strategy,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<InvalidationReport> {
        let outcome = cancellable(
            cancel,
            self.invalidator.invalidate_policy_change(previous, strategy, reason),
        )
        .await;
        if outcome.is_err() {
            self.record_error().await;
        }
        outcome
    }

    async fn is_admin(&self, user_id: &str, organization_id: &str, checks: u64) -> Result<bool> {
        let admin = self.roles.has_admin_role(user_id, organization_id).await?;
        if admin {
            debug!(user_id, organization_id, "admin short-circuit");
            if let Some(metrics) = &self.metrics {
                metrics.record_admin_short_circuit(checks).await;
            }
        }
        Ok(admin)
    }

    /// Cached manifest, or a freshly computed one; the flag is true on a cache hit
    async fn fetch_manifest(&self, user_id: &str, organization_id: &str) -> Result<(Arc<PermissionManifest>, bool)> {
        let key = CacheKey::new(user_id, organization_id);
        let generation = self.cache.generation();

        match self.cache.get(&key).await {
            Ok(Some((cached, tier))) if !cached.is_expired(self.clock.now()) => {
                debug!(user_id, organization_id, ?tier, "manifest cache hit");
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit().await;
                }
                return Ok((Arc::new(cached.into_manifest(user_id, organization_id)), true));
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, organization_id, error = %e, "cache lookup failed, recomputing"),
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss().await;
        }

        let manifest = self.compute(user_id, organization_id).await?;
        self.store(key, manifest.clone(), generation).await;
        Ok((manifest, false))
    }

    /// Warm L1 and hand L2/L3 population to the worker pool
    async fn store(&self, key: CacheKey, manifest: Arc<PermissionManifest>, generation: u64) {
        self.cache
            .set_local(&key, &manifest.to_cached(), self.config.manifest_ttl, generation);

        if !self.workers.enqueue(CacheJob::new(key, manifest, generation)) {
            if let Some(metrics) = &self.metrics {
                metrics.record_dropped_job().await;
            }
        }
    }

    /// Compile a fresh manifest
    async fn compute(&self, user_id: &str, organization_id: &str) -> Result<Arc<PermissionManifest>> {
        let now = self.clock.now();
        let user = self.users.get_user(user_id).await?;

        let subject = match &user {
            Some(user) => self.subject_context(user, organization_id, now).await?,
            None => None,
        };

        let permissions = match &subject {
            Some(subject) => {
                let policies = self.policies.user_policies(user_id, organization_id).await?;
                self.compiler.compile(subject, &policies, now)
            }
            None => {
                debug!(user_id, organization_id, "no active membership, compiling empty permission set");
                CompiledPermissions::default()
            }
        };

        let bloom_filter = BloomFilter::build(&permissions);
        let checksum = permissions.checksum()?;

        let mut available_organizations: Vec<OrganizationId> = user
            .iter()
            .flat_map(|u| u.memberships.iter())
            .filter(|m| m.is_active(now))
            .map(|m| m.organization_id.clone())
            .collect();
        available_organizations.sort();
        available_organizations.dedup();
        if available_organizations.is_empty() {
            available_organizations.push(organization_id.to_string());
        }

        debug!(
            user_id,
            organization_id,
            resources = permissions.resources.len(),
            bloom_bits = bloom_filter.popcount(),
            "compiled permission manifest"
        );

        Ok(Arc::new(PermissionManifest {
            version: self.config.version.clone(),
            user_id: user_id.to_string(),
            current_organization: organization_id.to_string(),
            available_organizations,
            computed_at: now,
            expires_at: now + to_chrono(self.config.manifest_ttl),
            permissions,
            bloom_filter,
            checksum,
        }))
    }

    /// Roles, groups and bundled policies of `user` in `organization_id`
    ///
    /// `None` when the user has no active membership there.
    async fn subject_context(
        &self,
        user: &User,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubjectContext>> {
        let Some(membership) = user.active_membership(organization_id, now) else {
            return Ok(None);
        };

        let graph = RoleGraph::build(
            self.roles
                .roles_for_business_unit(&membership.business_unit_id)
                .await?,
        )?;
        let usable = |id: &RoleId| {
            graph
                .get(id)
                .map_or(false, |role| role.is_active(now) && role.covers_organization(organization_id))
        };

        let held: Vec<RoleId> = membership.role_ids.iter().filter(|id| usable(id)).cloned().collect();
        let roles: Vec<RoleId> = graph.expand(held.iter()).into_iter().filter(|id| usable(id)).collect();
        let bundled: Vec<String> = roles
            .iter()
            .filter_map(|id| graph.get(id))
            .flat_map(|role| role.policy_ids.iter().cloned())
            .collect();

        Ok(Some(
            SubjectContext::new(user.id.as_str(), organization_id, membership.business_unit_id.as_str())
                .with_roles(roles)
                .with_groups(user.group_ids.iter().cloned())
                .with_bundled_policies(bundled),
        ))
    }

    /// Decide one check against a manifest
    fn evaluate(&self, manifest: &PermissionManifest, check: &ResourceCheck) -> CheckResult {
        if !self.registry.contains(&check.resource_type) {
            return CheckResult::deny(reason::not_registered(&check.resource_type));
        }

        if !manifest
            .bloom_filter
            .test(&BloomFilter::key(&check.resource_type, &check.action))
        {
            return CheckResult::deny(reason::BLOOM_MISS);
        }

        let Some(entry) = manifest.permissions.get(&check.resource_type) else {
            return CheckResult::deny(reason::no_permissions(&check.resource_type));
        };

        if !entry.allows(&check.action) {
            return CheckResult::deny(reason::action_not_allowed(&check.action, &check.resource_type));
        }

        if let Some(requested) = check.data_scope {
            if requested > entry.data_scope {
                return CheckResult::deny(reason::scope_too_narrow(requested, entry.data_scope));
            }
        }

        CheckResult::allow(reason::ALLOWED, Some(entry.data_scope))
    }

    async fn record_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error().await;
        }
    }

    /// Purge expired L3 rows
    pub async fn compact(&self) -> Result<u64> {
        self.cache.compact().await
    }

    /// Stop workers and background tasks, waiting up to `deadline`
    ///
    /// Queued cache jobs are drained without retries. Safe to call more
    /// than once.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        self.shutdown.cancel();

        self.workers.stop(deadline).await?;

        let remaining = deadline.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, self.background.wait())
            .await
            .map_err(|_| AuthzError::Timeout("background tasks did not stop before the deadline".into()))?;

        self.invalidator
            .drain(deadline.saturating_sub(started.elapsed()))
            .await?;

        info!("permission engine stopped");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    pub fn invalidator(&self) -> &InvalidationCoordinator {
        &self.invalidator
    }

    /// Metrics snapshot when metrics are enabled
    pub async fn metrics(&self) -> Option<EngineMetrics> {
        let metrics = self.metrics.as_ref()?;
        let mut snapshot = metrics.get_metrics().await;
        snapshot.failed_cache_jobs = self.workers.stats().failed;
        Some(snapshot)
    }

    pub fn metrics_collector(&self) -> Option<&MetricsCollector> {
        self.metrics.as_deref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }
}

impl Drop for PermissionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run `future` unless `cancel` fires first
async fn cancellable<T>(cancel: &CancellationToken, future: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthzError::Cancelled),
        result = future => result,
    }
}

/// Elapsed microseconds as fractional milliseconds
fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

async fn run_sweeper(cache: Arc<PermissionCache>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = cache.sweep_local();
                if removed > 0 {
                    debug!(removed, "swept expired L1 entries");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compiler::OpSet;
    use crate::directory::InMemoryDirectory;
    use crate::manifest::ResourcePermission;
    use crate::policy::{ActionSet, InMemoryPolicyStore, Policy};
    use crate::roles::Role;
    use crate::types::StandardOp::*;
    use crate::users::OrganizationMembership;
    use tracing_test::traced_test;

    struct Fixture {
        clock: Arc<ManualClock>,
        directory: Arc<InMemoryDirectory>,
        policies: Arc<InMemoryPolicyStore>,
        engine: PermissionEngine,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let directory = Arc::new(InMemoryDirectory::new(clock.clone()));
        directory.add_organization("org-1", "bu-1");
        directory.put_role(Role::new("dispatcher", "Dispatcher", "bu-1")).unwrap();
        directory.put_user(User::new("alice", "bu-1"));
        directory
            .grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &["dispatcher"]))
            .unwrap();

        let policies = Arc::new(InMemoryPolicyStore::new());
        let engine = PermissionEngine::new(
            EngineConfig::default(),
            Arc::new(ResourceRegistry::standard().unwrap()),
            Collaborators::with_clock(policies.clone(), directory.clone(), directory.clone(), clock.clone()),
        )
        .await
        .unwrap();

        Fixture {
            clock,
            directory,
            policies,
            engine,
        }
    }

    fn manifest_with(resource: &str, permission: ResourcePermission) -> PermissionManifest {
        let mut permissions = CompiledPermissions::default();
        permissions.resources.insert(resource.to_string(), permission);
        let now = Utc::now();
        PermissionManifest {
            version: "v3.0".into(),
            user_id: "u".into(),
            current_organization: "o".into(),
            available_organizations: vec!["o".into()],
            computed_at: now,
            expires_at: now,
            bloom_filter: BloomFilter::build(&permissions),
            checksum: String::new(),
            permissions,
        }
    }

    #[tokio::test]
    async fn test_evaluate_order_of_checks() {
        let f = fixture().await;
        let manifest = manifest_with(
            "invoice",
            ResourcePermission {
                standard_ops: OpSet::of(&[Read, List]),
                data_scope: DataScope::Organization,
                ..Default::default()
            },
        );

        let result = f.engine.evaluate(&manifest, &ResourceCheck::new("spaceship", "read"));
        assert_eq!(result.reason, "resource spaceship not registered");

        let result = f.engine.evaluate(&manifest, &ResourceCheck::new("invoice", "delete"));
        assert!(!result.allowed);

        let result = f.engine.evaluate(&manifest, &ResourceCheck::new("invoice", "read"));
        assert!(result.allowed);
        assert_eq!(result.data_scope, Some(DataScope::Organization));

        let wide = ResourceCheck::new("invoice", "read").requiring_scope(DataScope::All);
        let result = f.engine.evaluate(&manifest, &wide);
        assert!(!result.allowed);
        assert!(result.reason.contains("data scope"));
    }

    #[tokio::test]
    async fn test_empty_bloom_filter_allows_through() {
        let f = fixture().await;
        let mut manifest = manifest_with(
            "invoice",
            ResourcePermission {
                standard_ops: OpSet::of(&[Read]),
                ..Default::default()
            },
        );
        manifest.bloom_filter = BloomFilter::empty();

        assert!(f.engine.evaluate(&manifest, &ResourceCheck::new("invoice", "read")).allowed);
        let denied = f.engine.evaluate(&manifest, &ResourceCheck::new("customer", "read"));
        assert_eq!(denied.reason, "no permissions for resource customer");
    }

    #[tokio::test]
    async fn test_subject_context_expands_roles_and_bundles() {
        let f = fixture().await;
        f.directory
            .put_role(Role::new("base", "Base", "bu-1").with_policies(&["p-base"]))
            .unwrap();
        f.directory
            .put_role(
                Role::new("senior", "Senior", "bu-1")
                    .with_parents(&["base"])
                    .with_policies(&["p-senior"]),
            )
            .unwrap();
        f.directory
            .put_role(
                Role::new("old", "Old", "bu-1")
                    .with_policies(&["p-old"])
                    .expiring_at(f.clock.now() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        f.directory
            .grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &["senior", "old"]))
            .unwrap();

        let user = f.directory.get_user("alice").await.unwrap().unwrap();
        let subject = f
            .engine
            .subject_context(&user, "org-1", f.clock.now())
            .await
            .unwrap()
            .unwrap();

        assert!(subject.roles.contains("senior"));
        assert!(subject.roles.contains("base"));
        assert!(!subject.roles.contains("old"));
        assert!(subject.bundled_policies.contains("p-base"));
        assert!(!subject.bundled_policies.contains("p-old"));
    }

    #[tokio::test]
    async fn test_manifest_fields() {
        let f = fixture().await;
        f.policies
            .put(Policy::allow("p1", "Read roles", "bu-1").on("role", ActionSet::standard(&[Read]), DataScope::Organization))
            .await;

        let cancel = CancellationToken::new();
        let manifest = f.engine.get_user_permissions("alice", "org-1", &cancel).await.unwrap();

        assert_eq!(manifest.version, "v3.0");
        assert_eq!(manifest.available_organizations, vec!["org-1".to_string()]);
        assert_eq!(manifest.expires_at - manifest.computed_at, chrono::Duration::minutes(30));
        assert_eq!(manifest.checksum, manifest.permissions.checksum().unwrap());
        assert!(manifest.bloom_filter.test("role:read"));
    }

    #[tokio::test]
    async fn test_available_organizations_are_sorted_and_unique() {
        let f = fixture().await;
        let mut user = User::new("dan", "bu-1");
        user.memberships = ["org-3", "org-1", "org-3", "org-2"]
            .iter()
            .map(|org| OrganizationMembership::new("dan", *org, "bu-1", &[]))
            .collect();
        f.directory.put_user(user);

        let manifest = f
            .engine
            .get_user_permissions("dan", "org-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manifest.available_organizations, vec!["org-1", "org-2", "org-3"]);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .engine
            .check(&CheckRequest::new("alice", "org-1", "role", "read"), &cancel)
            .await;
        assert!(matches!(result, Err(AuthzError::Cancelled)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_admin_short_circuit_is_logged() {
        let f = fixture().await;
        f.directory
            .put_role(Role::new("administrator", "Administrator", "bu-1").admin())
            .unwrap();
        f.directory.put_user(User::new("root", "bu-1"));
        f.directory
            .grant_membership(OrganizationMembership::new("root", "org-1", "bu-1", &["administrator"]))
            .unwrap();

        let result = f
            .engine
            .check(&CheckRequest::new("root", "org-1", "invoice", "approve"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.data_scope, Some(DataScope::All));
        assert!(logs_contain("admin short-circuit"));
        assert_eq!(f.engine.cache_stats().local.entries, 0);
    }

    #[tokio::test]
    async fn test_stop_is_repeatable() {
        let f = fixture().await;
        f.engine.stop(Duration::from_secs(1)).await.unwrap();
        f.engine.stop(Duration::from_secs(1)).await.unwrap();
    }
}
