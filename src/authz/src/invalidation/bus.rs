//! Pub/sub transport for invalidation events

use super::event::{InvalidationEvent, InvalidationTarget};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

/// Cluster-wide publish/subscribe
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Payloads published on `channel` after this call
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

/// In-process bus; share one instance between engines to simulate a cluster
#[derive(Default)]
pub struct InMemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl InvalidationBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let receiver = self.sender(channel).subscribe();

        let stream = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(payload) => Some((payload, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation subscriber lagged, requesting full flush");
                    let flush = InvalidationEvent::new(&InvalidationTarget::Global, "subscriber lagged", Utc::now());
                    match serde_json::to_string(&flush) {
                        Ok(payload) => Some((payload, receiver)),
                        Err(_) => None,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("chan").await.unwrap();
        let mut b = bus.subscribe("chan").await.unwrap();
        let mut other = bus.subscribe("other").await.unwrap();

        bus.publish("chan", "hello".into()).await.unwrap();

        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));

        bus.publish("other", "x".into()).await.unwrap();
        assert_eq!(other.next().await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::new();
        assert!(bus.publish("nobody", "x".into()).await.is_ok());
    }
}
