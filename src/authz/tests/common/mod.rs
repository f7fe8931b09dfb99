//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tms_authz::cache::{InMemoryDurableStore, InMemoryKeyValueStore};
use tms_authz::{
    Collaborators, EngineConfig, InMemoryBus, InMemoryDirectory, InMemoryPolicyStore, ManualClock,
    OrganizationMembership, PermissionEngine, ResourceRegistry, Role, User,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const BU: &str = "bu-1";
pub const ORG: &str = "org-1";
pub const OTHER_ORG: &str = "org-2";

/// Shared backing services; several engines built from one harness behave
/// like a cluster
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub directory: Arc<InMemoryDirectory>,
    pub policies: Arc<InMemoryPolicyStore>,
    pub shared: Arc<InMemoryKeyValueStore>,
    pub durable: Arc<InMemoryDurableStore>,
    pub bus: Arc<InMemoryBus>,
    pub registry: Arc<ResourceRegistry>,
}

impl Harness {
    /// `alice` dispatches in org-1; `root` is an administrator there
    pub fn new() -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::starting_now());
        let directory = Arc::new(InMemoryDirectory::new(clock.clone()));

        directory.add_organization(ORG, BU);
        directory.add_organization(OTHER_ORG, BU);

        directory
            .put_role(Role::new("dispatcher", "Dispatcher", BU))
            .expect("dispatcher role");
        directory
            .put_role(Role::new("administrator", "Administrator", BU).admin())
            .expect("admin role");

        directory.put_user(User::new("alice", BU));
        directory.put_user(User::new("root", BU));
        directory
            .grant_membership(OrganizationMembership::new("alice", ORG, BU, &["dispatcher"]))
            .expect("alice membership");
        directory
            .grant_membership(OrganizationMembership::new("root", ORG, BU, &["administrator"]))
            .expect("root membership");

        Self {
            shared: Arc::new(InMemoryKeyValueStore::new(clock.clone())),
            durable: Arc::new(InMemoryDurableStore::new()),
            bus: Arc::new(InMemoryBus::new()),
            registry: Arc::new(ResourceRegistry::standard().expect("standard registry")),
            policies: Arc::new(InMemoryPolicyStore::new()),
            directory,
            clock,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::with_clock(
            self.policies.clone(),
            self.directory.clone(),
            self.directory.clone(),
            self.clock.clone(),
        )
        .with_caches(self.shared.clone(), self.durable.clone())
        .with_bus(self.bus.clone())
    }

    pub async fn engine(&self) -> PermissionEngine {
        self.engine_with(fast_config()).await
    }

    pub async fn engine_with(&self, config: EngineConfig) -> PermissionEngine {
        PermissionEngine::new(config, self.registry.clone(), self.collaborators())
            .await
            .expect("engine starts")
    }
}

/// Route engine logs to the test writer; `RUST_LOG` overrides the filter
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tms_authz=warn")))
        .with_test_writer()
        .try_init();
}

/// Defaults with short retry delays
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.retry_base_delay = Duration::from_millis(10);
    config
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Poll `condition` every 10ms for up to two seconds
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
