//! Cache invalidation
//!
//! The [`InvalidationCoordinator`] turns a change (membership, role, policy,
//! business unit or registry) into the set of `(user, organization)` cache
//! keys it affects, deletes them from every tier and publishes an
//! [`InvalidationEvent`] on [`INVALIDATION_CHANNEL`]. Other engine instances
//! receive the event through [`run_listener`] and evict their own L1.

pub mod bus;
pub mod coordinator;
pub mod event;
pub mod listener;

pub use bus::{InMemoryBus, InvalidationBus};
pub use coordinator::{InvalidationCoordinator, InvalidationReport, Strategy};
pub use event::{InvalidationEvent, InvalidationKind, InvalidationTarget};
pub use listener::{apply_event, run_listener};

/// Pub/sub channel carrying invalidation events
pub const INVALIDATION_CHANNEL: &str = "permission:invalidation";
