//! Topic Bus
//!
//! Thin pub/sub port over whatever transport the host wires in. The
//! contract is deliberately weak: no ordering, bounded message size, and
//! delivery only when both endpoints are live. Consumers must tolerate
//! loss, which the sync protocol treats as "announcement never arrived".
//! [`InMemoryBus`] implements the port for tests and single-process
//! clusters.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Default ceiling on one message (partition bodies travel via the content
/// store, never the bus)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// =============================================================================
// Port
// =============================================================================

/// Identifier returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// An active subscription: messages arrive on `receiver`; when the queue is
/// full the transport drops rather than buffering without bound
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub topic: String,
    pub receiver: mpsc::Receiver<Bytes>,
}

/// Duck-typed pub/sub transport
#[async_trait]
pub trait TopicBus: Send + Sync {
    /// Publish a payload; oversized payloads are an error
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe with a bounded inbound queue
    async fn subscribe(&self, topic: &str, queue_capacity: usize) -> Result<Subscription>;

    /// Tear down a subscription; idempotent
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

/// Shared bus handle
pub type TopicBusRef = Arc<dyn TopicBus>;

// =============================================================================
// In-Memory Bus
// =============================================================================

/// Process-local bus with lossy, bounded delivery
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    forwarders: DashMap<u64, tokio::task::JoinHandle<()>>,
    next_handle: AtomicU64,
    max_message_bytes: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            topics: DashMap::new(),
            forwarders: DashMap::new(),
            next_handle: AtomicU64::new(1),
            max_message_bytes,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if payload.len() > self.max_message_bytes {
            return Err(Error::Capacity(format!(
                "message of {} bytes exceeds bus limit {}",
                payload.len(),
                self.max_message_bytes
            )));
        }
        // No subscribers is not an error; the message is simply lost
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, queue_capacity: usize) -> Result<Subscription> {
        let mut upstream = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let topic_owned = topic.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(payload) => {
                        if tx.try_send(payload).is_err() {
                            // Queue full or receiver gone: drop, don't buffer
                            if tx.is_closed() {
                                break;
                            }
                            warn!(topic = %topic_owned, "inbound queue full, dropping message");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic_owned, skipped, "bus reader lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.forwarders.insert(handle_id, forwarder);
        Ok(Subscription {
            handle: SubscriptionHandle(handle_id),
            topic: topic.to_string(),
            receiver: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some((_, task)) = self.forwarders.remove(&handle.0) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("/c/index/announce", 8).await.unwrap();

        bus.publish("/c/index/announce", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = InMemoryBus::new();
        let mut announce = bus.subscribe("/c/index/announce", 8).await.unwrap();
        let _request = bus.subscribe("/c/index/request", 8).await.unwrap();

        bus.publish("/c/index/request", Bytes::from_static(b"req"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(announce.receiver.try_recv().is_err(), "cross-topic leak");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_lost_not_error() {
        let bus = InMemoryBus::new();
        bus.publish("/c/index/announce", Bytes::from_static(b"void"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let bus = InMemoryBus::with_max_message_bytes(16);
        let err = bus
            .publish("/c/index/announce", Bytes::from(vec![0u8; 17]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("/c/index/announce", 8).await.unwrap();
        bus.unsubscribe(sub.handle).await.unwrap();
        // Idempotent
        bus.unsubscribe(sub.handle).await.unwrap();

        bus.publish("/c/index/announce", Bytes::from_static(b"late"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_overflow() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("/c/index/announce", 2).await.unwrap();

        for i in 0..20u8 {
            bus.publish("/c/index/announce", Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // At most the queue capacity is waiting; the rest were dropped
        let mut received = 0;
        while sub.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 3, "expected bounded delivery, got {}", received);
    }
}
