//! Invalidation across engine instances sharing a bus

mod common;

use common::{eventually, token, Harness, BU, ORG, OTHER_ORG};
use futures::StreamExt;
use std::time::Duration;
use tms_authz::{
    ActionSet, CheckRequest, DataScope, InvalidationBus, InvalidationEvent, InvalidationKind, InvalidationTarget,
    OrganizationMembership, Policy, Role, StandardOp, Strategy, Subject, User, INVALIDATION_CHANNEL,
};

fn read(user: &str, resource: &str) -> CheckRequest {
    CheckRequest::new(user, ORG, resource, "read")
}

/// `carol` holds `senior-dispatcher`, which inherits from `dispatcher`;
/// dispatcher bundles `p-bundle`
async fn with_role_hierarchy() -> Harness {
    let h = Harness::new();
    h.directory
        .put_role(Role::new("dispatcher", "Dispatcher", BU).with_policies(&["p-bundle"]))
        .unwrap();
    h.directory
        .put_role(Role::new("senior-dispatcher", "Senior Dispatcher", BU).with_parents(&["dispatcher"]))
        .unwrap();
    h.directory.put_user(User::new("carol", BU));
    h.directory
        .grant_membership(OrganizationMembership::new("carol", ORG, BU, &["senior-dispatcher"]))
        .unwrap();

    h.policies
        .put(
            Policy::allow("p-bundle", "Dispatch board", BU)
                .for_subject(Subject::role("planner"))
                .on("trailer", ActionSet::standard(&[StandardOp::Read]), DataScope::Organization),
        )
        .await;
    h
}

// ============================================================================
// PEER PROPAGATION
// ============================================================================

#[tokio::test]
async fn test_role_change_reaches_peer() {
    let h = with_role_hierarchy().await;
    let node_a = h.engine().await;
    let node_b = h.engine().await;

    assert!(node_b.check(&read("carol", "trailer"), &token()).await.unwrap().allowed);
    assert!(node_b.check(&read("alice", "trailer"), &token()).await.unwrap().allowed);
    assert!(eventually(|| async { node_b.worker_stats().processed == 2 }).await);

    h.directory
        .put_role(Role::new("dispatcher", "Dispatcher", BU))
        .unwrap();
    let report = node_a
        .invalidate(&InvalidationTarget::Role("dispatcher".into()), &Strategy::default(), "role updated", &token())
        .await
        .unwrap();
    assert_eq!(report.kind, InvalidationKind::Role);
    assert_eq!(report.keys, 2);

    let converged = eventually(|| async {
        let alice = node_b.check(&read("alice", "trailer"), &token()).await.unwrap();
        let carol = node_b.check(&read("carol", "trailer"), &token()).await.unwrap();
        !alice.allowed && !carol.allowed
    })
    .await;
    assert!(converged);
}

#[tokio::test]
async fn test_role_invalidation_without_cascade_skips_descendants() {
    let h = with_role_hierarchy().await;
    let engine = h.engine().await;

    let strategy = Strategy {
        cascade: false,
        ..Strategy::default()
    };
    let report = engine
        .invalidate(&InvalidationTarget::Role("dispatcher".into()), &strategy, "role updated", &token())
        .await
        .unwrap();
    assert_eq!(report.keys, 1);
}

#[tokio::test]
async fn test_organization_invalidation_reaches_peer() {
    let h = Harness::new();
    h.policies
        .put(Policy::allow("p", "Roles", BU).on("role", ActionSet::standard(&[StandardOp::Read]), DataScope::Organization))
        .await;
    let node_a = h.engine().await;
    let node_b = h.engine().await;

    assert!(node_b.check(&read("alice", "role"), &token()).await.unwrap().allowed);
    assert_eq!(node_b.cache_stats().local.entries, 1);

    node_a
        .invalidate(&InvalidationTarget::Organization(ORG.into()), &Strategy::default(), "org suspended", &token())
        .await
        .unwrap();

    assert!(eventually(|| async { node_b.cache_stats().local.entries == 0 }).await);
}

#[tokio::test]
async fn test_revoked_membership_is_denied_after_organization_invalidation() {
    let h = Harness::new();
    h.policies
        .put(Policy::allow("p", "Roles", BU).on("role", ActionSet::standard(&[StandardOp::Read]), DataScope::Organization))
        .await;
    let node_a = h.engine().await;
    let node_b = h.engine().await;

    assert!(node_b.check(&read("alice", "role"), &token()).await.unwrap().allowed);
    assert!(eventually(|| async { node_b.worker_stats().processed == 1 }).await);

    assert!(h.directory.revoke_membership("alice", ORG));
    let report = node_a
        .invalidate(&InvalidationTarget::Organization(ORG.into()), &Strategy::default(), "membership revoked", &token())
        .await
        .unwrap();
    // root still belongs; alice is only known from the cached manifest
    assert_eq!(report.keys, 2);

    let after = node_a.check(&read("alice", "role"), &token()).await.unwrap();
    assert!(!after.allowed);
    assert!(!after.cache_hit);

    let converged = eventually(|| async { !node_b.check(&read("alice", "role"), &token()).await.unwrap().allowed }).await;
    assert!(converged);
}

#[tokio::test]
async fn test_unpublished_invalidation_stays_local() {
    let h = Harness::new();
    let node_a = h.engine().await;
    let node_b = h.engine().await;

    node_b.check(&read("alice", "role"), &token()).await.unwrap();

    let strategy = Strategy {
        publish_event: false,
        ..Strategy::default()
    };
    let report = node_a
        .invalidate(&InvalidationTarget::Global, &strategy, "maintenance", &token())
        .await
        .unwrap();
    assert!(!report.published);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node_b.cache_stats().local.entries, 1);
}

#[tokio::test]
async fn test_events_on_the_wire() {
    let h = Harness::new();
    let mut events = h.bus.subscribe(INVALIDATION_CHANNEL).await.unwrap();
    let engine = h.engine().await;

    engine.invalidate_cache("alice", ORG, &token()).await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    let event: InvalidationEvent = serde_json::from_str(&payload).unwrap();
    assert_eq!(event.kind, InvalidationKind::User);
    assert_eq!(event.user_id.as_deref(), Some("alice"));
    assert_eq!(event.organization_id.as_deref(), Some(ORG));
    assert_eq!(event.source.as_deref(), Some(engine.invalidator().instance_id()));
}

#[tokio::test]
async fn test_foreign_publisher_event_is_applied() {
    let h = Harness::new();
    let engine = h.engine().await;
    engine.check(&read("alice", "role"), &token()).await.unwrap();

    let payload = r#"{"type":"user","userId":"alice","timestamp":"2026-01-01T00:00:00Z","reason":"admin console"}"#;
    h.bus.publish(INVALIDATION_CHANNEL, payload.to_string()).await.unwrap();

    assert!(eventually(|| async { engine.cache_stats().local.entries == 0 }).await);
}

// ============================================================================
// BACKGROUND COMPLETION
// ============================================================================

#[tokio::test]
async fn test_non_waiting_invalidation_completes_by_stop() {
    let h = Harness::new();
    h.directory
        .grant_membership(OrganizationMembership::new("alice", OTHER_ORG, BU, &[]))
        .unwrap();
    let engine = h.engine().await;
    engine.check(&read("alice", "role"), &token()).await.unwrap();
    engine.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(h.durable.len(), 1);

    let restarted = h.engine().await;
    let strategy = Strategy {
        wait_for_completion: false,
        ..Strategy::default()
    };
    let report = restarted
        .invalidate(&InvalidationTarget::user_everywhere("alice"), &strategy, "offboarding", &token())
        .await
        .unwrap();
    assert!(report.pending);
    assert_eq!(report.keys, 2);

    restarted.stop(Duration::from_secs(5)).await.unwrap();
    assert!(h.durable.is_empty());
}
