//! Peer invalidation listener
//!
//! L2 and L3 are shared, so a publishing instance already evicted them. Peers
//! only need to drop their own L1 entries.

use super::event::{InvalidationEvent, InvalidationKind};
use crate::cache::{CacheKey, PermissionCache};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consume `events` until the stream ends or `shutdown` fires
pub async fn run_listener(
    mut events: BoxStream<'static, String>,
    cache: Arc<PermissionCache>,
    instance_id: String,
    shutdown: CancellationToken,
) {
    info!(instance_id = %instance_id, "invalidation listener started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = events.next() => match next {
                Some(payload) => handle_payload(&cache, &instance_id, &payload),
                None => {
                    warn!("invalidation stream closed");
                    break;
                }
            },
        }
    }

    info!(instance_id = %instance_id, "invalidation listener stopped");
}

fn handle_payload(cache: &PermissionCache, instance_id: &str, payload: &str) {
    let event: InvalidationEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "ignoring malformed invalidation event");
            return;
        }
    };

    if event.source.as_deref() == Some(instance_id) {
        return;
    }

    let evicted = apply_event(cache, &event);
    debug!(kind = ?event.kind, evicted, reason = %event.reason, "applied peer invalidation");
}

/// Evict the L1 entries `event` covers, returning how many were removed
pub fn apply_event(cache: &PermissionCache, event: &InvalidationEvent) -> usize {
    match (event.kind, &event.user_id, &event.organization_id) {
        (InvalidationKind::User, Some(user_id), Some(organization_id)) => {
            usize::from(cache.evict_local(&CacheKey::new(user_id.as_str(), organization_id.as_str())))
        }
        (InvalidationKind::User, Some(user_id), None) => cache.evict_local_user(user_id),
        (InvalidationKind::Organization, _, Some(organization_id)) => cache.evict_local_organization(organization_id),
        _ => cache.flush_local(),
    }
}
