//! Alert construction and the outbound publish queue.
//!
//! `emit` assigns the id, enqueues the alert and returns immediately. Both
//! happen under one lock, so the outbox receives alerts in id order. A single
//! outbox task serializes alerts and publishes them in that order, retrying
//! transport failures per [`RetryPolicy`]. Alerts that cannot be enqueued or
//! published are dropped and counted, never lost silently.

use crate::alert::{Alert, ReadingSnapshot};
use crate::detect::Severity;
use crate::engine::stats::{Counter, EngineStats};
use crate::telemetry::{FeatureVector, Reading};
use crate::transport::Channel;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total publish attempts per alert, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

pub struct AlertEmitter {
    /// Next alert id. Held while enqueueing.
    next_id: Mutex<u64>,
    outbox: mpsc::Sender<Alert>,
    stats: Arc<EngineStats>,
}

impl AlertEmitter {
    /// Start the outbox task and return the emitter feeding it. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        channel: Arc<dyn Channel>,
        topic: String,
        policy: RetryPolicy,
        capacity: usize,
        stats: Arc<EngineStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_outbox(rx, channel, topic, policy, stats.clone()));
        Self {
            next_id: Mutex::new(1),
            outbox: tx,
            stats,
        }
    }

    /// Build the alert with the next id and hand it to the outbox.
    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        machine_id: &str,
        timestamp: DateTime<Utc>,
        score: f64,
        severity: Severity,
        features: FeatureVector,
        reading: Reading,
        factors: Vec<String>,
    ) -> Alert {
        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let alert = Alert {
            alert_id: *next_id,
            machine_id: machine_id.to_string(),
            timestamp,
            severity,
            anomaly_score: score,
            reading_snapshot: ReadingSnapshot { features, reading },
            recommendation: factors,
        };
        *next_id += 1;
        let queued = self.outbox.try_send(alert.clone());
        drop(next_id);

        self.stats.incr(Counter::AlertsEmitted);
        if let Err(e) = queued {
            self.stats.incr(Counter::AlertsDropped);
            error!(
                alert_id = alert.alert_id,
                machine = %machine_id,
                error = %e,
                "alert dropped before publish"
            );
        }
        alert
    }
}

async fn run_outbox(
    mut rx: mpsc::Receiver<Alert>,
    channel: Arc<dyn Channel>,
    topic: String,
    policy: RetryPolicy,
    stats: Arc<EngineStats>,
) {
    while let Some(alert) = rx.recv().await {
        let payload = match serde_json::to_vec(&alert) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                stats.incr(Counter::AlertsDropped);
                error!(alert_id = alert.alert_id, error = %e, "failed to encode alert");
                continue;
            }
        };

        let mut attempt = 1;
        loop {
            match channel.publish(&topic, payload.clone()).await {
                Ok(()) => {
                    stats.incr(Counter::AlertsPublished);
                    debug!(alert_id = alert.alert_id, %topic, attempt, "alert published");
                    break;
                }
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(
                        alert_id = alert.alert_id,
                        attempt,
                        error = %e,
                        ?delay,
                        "alert publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    stats.incr(Counter::AlertsDropped);
                    error!(
                        alert_id = alert.alert_id,
                        attempts = attempt,
                        error = %e,
                        "alert dropped after exhausting publish retries"
                    );
                    break;
                }
            }
        }
    }
    debug!("alert outbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FeatureExtractor;
    use crate::transport::MemoryChannel;
    use futures::StreamExt;
    use std::collections::HashSet;

    fn snapshot() -> (FeatureVector, Reading) {
        let reading = Reading::new("M1", Utc::now(), 95.0, 2.0, 10.0, 6.0, 1500.0);
        (FeatureExtractor::default().extract(&reading).unwrap(), reading)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(20), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_publishes_to_alert_topic() {
        let channel = Arc::new(MemoryChannel::default());
        let mut sub = channel.subscribe("factory/alerts/anomaly").await.unwrap();
        let stats = Arc::new(EngineStats::default());
        let emitter = AlertEmitter::spawn(
            channel.clone(),
            "factory/alerts/anomaly".into(),
            fast_policy(),
            16,
            stats.clone(),
        );

        let (features, reading) = snapshot();
        let alert = emitter.emit(
            "M1",
            reading.timestamp,
            -0.7,
            Severity::Critical,
            features,
            reading,
            vec!["Temperature exceeds safe threshold".into()],
        );
        assert_eq!(alert.alert_id, 1);

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        let received: Alert = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(received, alert);
        assert_eq!(stats.snapshot(0).alerts_published, 1);
    }

    #[tokio::test]
    async fn test_unavailable_transport_counts_drop() {
        let channel = Arc::new(MemoryChannel::default());
        channel.set_available(false);
        let stats = Arc::new(EngineStats::default());
        let emitter =
            AlertEmitter::spawn(channel.clone(), "a".into(), fast_policy(), 16, stats.clone());

        let (features, reading) = snapshot();
        emitter.emit("M1", reading.timestamp, -0.7, Severity::Critical, features, reading, vec![]);

        for _ in 0..100 {
            if stats.snapshot(0).alerts_dropped == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = stats.snapshot(0);
        assert_eq!(snap.alerts_dropped, 1);
        assert_eq!(snap.alerts_published, 0);
        assert_eq!(snap.anomalies_detected, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ids_unique_under_concurrency() {
        let channel = Arc::new(MemoryChannel::default());
        let stats = Arc::new(EngineStats::default());
        let emitter = Arc::new(AlertEmitter::spawn(
            channel,
            "a".into(),
            fast_policy(),
            4096,
            stats,
        ));

        let mut tasks = Vec::new();
        for m in 0..8 {
            let emitter = emitter.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    let (features, reading) = snapshot();
                    let alert = emitter.emit(
                        &format!("M{}", m),
                        reading.timestamp,
                        -0.6,
                        Severity::Critical,
                        features,
                        reading,
                        vec![],
                    );
                    ids.push(alert.alert_id);
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for task in tasks {
            let ids = task.await.unwrap();
            // Strictly increasing within each emitting task.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        assert_eq!(all.len(), 400);
        assert_eq!(all.iter().min(), Some(&1));
        assert_eq!(all.iter().max(), Some(&400));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alert_topic_sees_increasing_ids() {
        let channel = Arc::new(MemoryChannel::new(4096));
        let mut sub = channel.subscribe("factory/alerts/anomaly").await.unwrap();
        let stats = Arc::new(EngineStats::default());
        let emitter = Arc::new(AlertEmitter::spawn(
            channel.clone(),
            "factory/alerts/anomaly".into(),
            fast_policy(),
            4096,
            stats,
        ));

        let mut tasks = Vec::new();
        for m in 0..8 {
            let emitter = emitter.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let (features, reading) = snapshot();
                    emitter.emit(
                        &format!("M{}", m),
                        reading.timestamp,
                        -0.6,
                        Severity::Critical,
                        features,
                        reading,
                        vec![],
                    );
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut published = Vec::new();
        while published.len() < 400 {
            let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap();
            let alert: Alert = serde_json::from_slice(&msg.payload).unwrap();
            published.push(alert.alert_id);
        }
        assert_eq!(published, (1..=400).collect::<Vec<u64>>());
    }
}
