use crate::alert::Alert;
use crate::engine::Coordinator;
use crate::transport::{Channel, ChannelError};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub feed: AlertFeed,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: Coordinator, feed: AlertFeed) -> Self {
        Self {
            coordinator,
            feed,
            started_at: Instant::now(),
        }
    }
}

/// Most recent alerts, as seen by a subscriber of the alert topic.
#[derive(Clone)]
pub struct AlertFeed {
    alerts: Arc<RwLock<VecDeque<Alert>>>,
    capacity: usize,
}

impl AlertFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, alert: Alert) {
        if self.capacity == 0 {
            return;
        }
        let mut alerts = self.alerts.write().await;
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Up to `limit` alerts, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.alerts.read().await.len()
    }

    /// Follow `topic` on `channel`, appending every decodable alert.
    pub async fn follow(
        &self,
        channel: &dyn Channel,
        topic: &str,
    ) -> Result<JoinHandle<()>, ChannelError> {
        let mut subscription = channel.subscribe(topic).await?;
        let feed = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                match serde_json::from_slice::<Alert>(&message.payload) {
                    Ok(alert) => feed.push(alert).await,
                    Err(e) => {
                        warn!(topic = %message.topic, error = %e, "ignoring undecodable alert")
                    }
                }
            }
            debug!("alert feed subscription closed");
        }))
    }
}
