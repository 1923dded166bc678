//! In-process channel backed by a tokio broadcast queue.
//!
//! Delivery is at-most-once: messages published with no live subscriber are
//! discarded, and a subscriber that falls behind by more than the queue
//! capacity skips the oldest messages.

use crate::transport::{Channel, ChannelError, Message, Subscription, TopicFilter};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct MemoryChannel {
    tx: broadcast::Sender<Message>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a broker outage: while unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("in-process broker offline".into()));
        }
        // No subscribers is not an error.
        let _ = self.tx.send(Message {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, ChannelError> {
        let filter = TopicFilter::parse(pattern)?;
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold((rx, filter), |(mut rx, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if filter.matches(&msg.topic) => return Some((msg, (rx, filter))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_filtered_delivery() {
        let channel = MemoryChannel::default();
        let mut sub = channel.subscribe("factory/machines/+/sensors").await.unwrap();

        channel.publish("factory/alerts/anomaly", Bytes::from_static(b"a")).await.unwrap();
        channel
            .publish("factory/machines/M1/sensors", Bytes::from_static(b"r"))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "factory/machines/M1/sensors");
        assert_eq!(&msg.payload[..], b"r");
    }

    #[tokio::test]
    async fn test_unavailable_publish_fails() {
        let channel = MemoryChannel::default();
        channel.set_available(false);
        let err = channel.publish("t", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
        channel.set_available(true);
        assert!(channel.publish("t", Bytes::new()).await.is_ok());
    }
}
