//! # TMS Authorization Engine
//!
//! Multi-tenant permission engine for a transport management platform.
//!
//! ## Features
//!
//! - **Policy compilation** of priority-ordered allow/deny policies into
//!   per-user bitfields, extended operations and data scopes
//! - **Bloom pre-filter** for O(1) negative checks
//! - **Three-tier cache** (in-process LRU, shared key-value store, durable store)
//! - **Invalidation** at user, organization, business unit, policy, role and
//!   global granularity, propagated to peers over pub/sub
//! - **Background cache population** with bounded queue and retry
//! - **Admin short-circuit** for administrative roles
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tms_authz::{
//!     ActionSet, CheckRequest, Collaborators, DataScope, EngineConfig, InMemoryDirectory,
//!     InMemoryPolicyStore, OrganizationMembership, PermissionEngine, Policy, ResourceRegistry,
//!     StandardOp, SystemClock, User,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directory = Arc::new(InMemoryDirectory::new(Arc::new(SystemClock)));
//!     directory.add_organization("org-1", "bu-1");
//!     directory.put_user(User::new("alice", "bu-1"));
//!     directory.grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &[]))?;
//!
//!     let policies = Arc::new(InMemoryPolicyStore::new());
//!     policies
//!         .put(Policy::allow("p-1", "Dispatch", "bu-1").on(
//!             "shipment",
//!             ActionSet::standard(&[StandardOp::Read, StandardOp::Update]),
//!             DataScope::Organization,
//!         ))
//!         .await;
//!
//!     let engine = PermissionEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(ResourceRegistry::standard()?),
//!         Collaborators::new(policies, directory.clone(), directory),
//!     )
//!     .await?;
//!
//!     let cancel = CancellationToken::new();
//!     let result = engine
//!         .check(&CheckRequest::new("alice", "org-1", "shipment", "update"), &cancel)
//!         .await?;
//!     assert!(result.allowed);
//!
//!     engine.stop(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod bloom;
pub mod cache;
pub mod clock;
pub mod compiler;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod hash;
pub mod invalidation;
pub mod manifest;
pub mod policy;
pub mod registry;
pub mod roles;
pub mod types;
pub mod users;
pub mod worker;

// Re-export commonly used types
pub use bloom::BloomFilter;
pub use cache::{CacheKey, CacheStats, CacheTier, DurableStore, KeyValueStore, PermissionCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compiler::{OpSet, PolicyCompiler, SortedOps, SubjectContext};
pub use config::{CacheConfig, EngineConfig, InvalidationConfig, WorkerConfig};
pub use directory::InMemoryDirectory;
pub use engine::{
    BatchCheckRequest, BatchCheckResult, CheckRequest, CheckResult, Collaborators, EngineMetrics, PermissionEngine,
    ResourceCheck,
};
pub use error::{AuthzError, GraphError, Result};
pub use invalidation::{
    InMemoryBus, InvalidationBus, InvalidationEvent, InvalidationKind, InvalidationReport, InvalidationTarget,
    Strategy, INVALIDATION_CHANNEL,
};
pub use manifest::{CachedPermissions, CompiledPermissions, PermissionManifest, ResourcePermission};
pub use policy::{
    ActionSet, Condition, InMemoryPolicyStore, Policy, PolicyEffect, PolicyRepository, PolicyScope, Subject,
    SubjectType,
};
pub use registry::{ResourceDefinition, ResourceRegistry};
pub use roles::{Role, RoleGraph, RoleRepository};
pub use types::{DataScope, StandardOp};
pub use users::{OrganizationMembership, User, UserRepository};
pub use worker::{CacheJob, CacheWorkerPool, WorkerStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
