//! Streaming coordinator: routes readings to per-machine workers.

pub mod machine;
pub mod stats;

use crate::alert::AlertEmitter;
use crate::config::Config;
use crate::detect::{DetectError, ForestParams, ModelStore, SeverityClassifier};
use crate::telemetry::{FeatureExtractor, Reading};
use crate::transport::{topics, Channel, ChannelError, Message, Subscription};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::machine::Command;
use self::stats::Counter;

pub use self::machine::{MachineStatus, ModelInfo, Outcome, Phase};
pub use self::stats::{EngineStats, StatsSnapshot};

/// Everything a machine worker needs, shared read-only across workers.
pub(crate) struct EngineContext {
    pub(crate) extractor: FeatureExtractor,
    pub(crate) classifier: SeverityClassifier,
    pub(crate) params: ForestParams,
    pub(crate) min_training_samples: usize,
    pub(crate) history_len: usize,
    pub(crate) store: Option<ModelStore>,
    pub(crate) emitter: AlertEmitter,
    pub(crate) stats: Arc<EngineStats>,
}

/// Cheap to clone; all clones drive the same set of machines.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<EngineContext>,
    machines: RwLock<HashMap<String, mpsc::Sender<Command>>>,
    queue_depth: usize,
    namespace: String,
    channel: Arc<dyn Channel>,
}

impl Coordinator {
    /// Build the engine and start its alert outbox. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &Config, channel: Arc<dyn Channel>) -> Result<Self> {
        let extractor = FeatureExtractor::new(config.model.features.clone())
            .context("invalid model.features")?;
        let stats = Arc::new(EngineStats::default());
        let namespace = config.transport.namespace.clone();
        let emitter = AlertEmitter::spawn(
            channel.clone(),
            topics::alerts(&namespace),
            config.alerts.retry.clone(),
            config.alerts.outbox_capacity,
            stats.clone(),
        );
        let store = config.storage.active_dir().map(ModelStore::new);

        info!(
            features = ?extractor.layout(),
            min_training_samples = config.engine.min_training_samples,
            n_estimators = config.model.n_estimators,
            persistence = store.is_some(),
            "anomaly engine initialized"
        );

        let ctx = EngineContext {
            extractor,
            classifier: SeverityClassifier::new(
                config.severity.clone(),
                config.safety.rules.clone(),
            ),
            params: config.model.forest_params(),
            min_training_samples: config.engine.min_training_samples,
            history_len: config.engine.history_len,
            store,
            emitter,
            stats,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                machines: RwLock::new(HashMap::new()),
                queue_depth: config.engine.queue_depth,
                namespace,
                channel,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.inner.channel.clone()
    }

    pub fn stats_handle(&self) -> Arc<EngineStats> {
        self.inner.ctx.stats.clone()
    }

    /// Process one reading and wait for its outcome.
    pub async fn submit(&self, reading: Reading) -> Outcome {
        let (tx, rx) = oneshot::channel();
        if let Some(rejected) = self.route(reading, Some(tx)).await {
            return rejected;
        }
        rx.await.unwrap_or_else(|_| Outcome::Rejected {
            reason: "machine worker stopped".to_string(),
        })
    }

    /// Queue one reading without waiting for it to be processed.
    pub async fn dispatch(&self, reading: Reading) {
        self.route(reading, None).await;
    }

    /// Validate and hand off to the machine's worker. Returns an outcome only
    /// when the reading was rejected before reaching a worker.
    ///
    /// The hand-off never waits: a machine whose queue is full (for example
    /// while it fits its model) loses the reading, and every other machine
    /// keeps flowing.
    async fn route(
        &self,
        reading: Reading,
        reply: Option<oneshot::Sender<Outcome>>,
    ) -> Option<Outcome> {
        let ctx = &self.inner.ctx;
        ctx.stats.incr(Counter::Readings);

        let features = match ctx.extractor.extract(&reading) {
            Ok(features) => features,
            Err(e) => return Some(self.reject(e)),
        };

        let machine_id = reading.machine_id.clone();
        let worker = self.worker(&machine_id).await;
        let cmd = Command::Reading {
            reading,
            features,
            reply,
        };
        match worker.try_send(cmd) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                ctx.stats.incr(Counter::Overflowed);
                warn!(
                    machine = %machine_id,
                    queue_depth = self.inner.queue_depth,
                    "machine queue full, dropping reading"
                );
                Some(Outcome::Rejected {
                    reason: format!("queue for machine '{}' is full", machine_id),
                })
            }
            Err(TrySendError::Closed(_)) => {
                error!(machine = %machine_id, "machine worker stopped, reading lost");
                self.inner.machines.write().await.remove(&machine_id);
                Some(Outcome::Rejected {
                    reason: "machine worker stopped".to_string(),
                })
            }
        }
    }

    fn reject(&self, err: DetectError) -> Outcome {
        self.inner.ctx.stats.incr(Counter::Malformed);
        warn!(error = %err, "dropping malformed reading");
        Outcome::Rejected {
            reason: err.to_string(),
        }
    }

    /// Sender for `machine_id`'s worker, spawning it on first sight.
    async fn worker(&self, machine_id: &str) -> mpsc::Sender<Command> {
        if let Some(tx) = self.inner.machines.read().await.get(machine_id) {
            return tx.clone();
        }
        let mut machines = self.inner.machines.write().await;
        machines
            .entry(machine_id.to_string())
            .or_insert_with(|| {
                info!(machine = %machine_id, "new machine, starting worker");
                let (tx, rx) = mpsc::channel(self.inner.queue_depth);
                tokio::spawn(machine::run(machine_id.to_string(), self.inner.ctx.clone(), rx));
                tx
            })
            .clone()
    }

    /// Parse a JSON reading payload.
    pub fn decode(payload: &[u8]) -> Result<Reading, DetectError> {
        serde_json::from_slice(payload).map_err(|e| DetectError::MalformedReading {
            machine_id: String::new(),
            reason: e.to_string(),
        })
    }

    /// Handle one message from the sensor subscription.
    pub async fn ingest(&self, message: Message) {
        let reading = match Self::decode(&message.payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.inner.ctx.stats.incr(Counter::Readings);
                self.reject(e);
                debug!(topic = %message.topic, "undecodable payload");
                return;
            }
        };

        if let Some(topic_machine) = topics::machine_of(&message.topic) {
            if topic_machine != reading.machine_id {
                self.inner.ctx.stats.incr(Counter::Readings);
                self.reject(DetectError::MalformedReading {
                    machine_id: reading.machine_id,
                    reason: format!("published on topic of machine '{}'", topic_machine),
                });
                return;
            }
        }

        self.dispatch(reading).await;
    }

    /// Consume `subscription` until it ends.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(message) = subscription.next().await {
            self.ingest(message).await;
        }
        info!("sensor subscription closed");
    }

    /// Subscribe to every machine's sensor topic and process in the background.
    pub async fn start(&self) -> Result<JoinHandle<()>, ChannelError> {
        let pattern = topics::all_sensors(&self.inner.namespace);
        let subscription = self.inner.channel.subscribe(&pattern).await?;
        info!(%pattern, "subscribed to sensor telemetry");
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run(subscription).await }))
    }

    /// Start workers for every machine with a persisted model so they come
    /// up TRAINED before their first reading. Returns the number found.
    pub async fn preload(&self) -> usize {
        let Some(store) = self.inner.ctx.store.clone() else {
            return 0;
        };
        let ids = match tokio::task::spawn_blocking(move || store.list()).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to scan model store");
                return 0;
            }
            Err(e) => {
                error!(error = %e, "model store scan task failed");
                return 0;
            }
        };
        for id in &ids {
            self.worker(id).await;
        }
        info!(count = ids.len(), "persisted models found");
        ids.len()
    }

    pub async fn status(&self, machine_id: &str) -> Option<MachineStatus> {
        let tx = self.inner.machines.read().await.get(machine_id).cloned()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Status(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Status of every known machine, ordered by id.
    pub async fn statuses(&self) -> Vec<MachineStatus> {
        let mut ids: Vec<String> = self.inner.machines.read().await.keys().cloned().collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.status(&id).await {
                out.push(status);
            }
        }
        out
    }

    /// Most recent readings for `machine_id`, oldest first.
    pub async fn history(&self, machine_id: &str) -> Option<Vec<Reading>> {
        let tx = self.inner.machines.read().await.get(machine_id).cloned()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::History(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let machines = self.inner.machines.read().await.len();
        self.inner.ctx.stats.snapshot(machines)
    }

    /// Log a statistics line every `every`.
    pub fn spawn_stats_reporter(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let s = this.stats().await;
                info!(
                    machines = s.machines_monitored,
                    readings = s.total_readings,
                    scored = s.scored_readings,
                    anomalies = s.anomalies_detected,
                    anomaly_rate = %format!("{:.2}%", s.anomaly_rate * 100.0),
                    malformed = s.malformed_readings,
                    overflowed = s.overflowed_readings,
                    alerts_dropped = s.alerts_dropped,
                    "engine statistics"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use chrono::Utc;

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.engine.min_training_samples = 5;
        config.model.n_estimators = 20;
        config.storage.enabled = false;
        config
    }

    fn reading(id: &str, i: usize) -> Reading {
        let t = i as f64;
        Reading::new(
            id,
            Utc::now(),
            65.0 + (0.7 * t).sin(),
            2.0 + 0.2 * (1.3 * t).sin(),
            10.0 + 0.3 * (0.9 * t).cos(),
            6.0 + 0.1 * (2.1 * t).sin(),
            1500.0 + 20.0 * (0.5 * t).cos(),
        )
    }

    fn coordinator(config: &Config) -> Coordinator {
        Coordinator::new(config, Arc::new(MemoryChannel::default())).unwrap()
    }

    #[tokio::test]
    async fn test_cold_then_trained() {
        let coordinator = coordinator(&quick_config());
        for i in 0..4 {
            assert_eq!(
                coordinator.submit(reading("M1", i)).await,
                Outcome::Buffered { samples: i + 1, needed: 5 }
            );
        }
        assert_eq!(
            coordinator.submit(reading("M1", 4)).await,
            Outcome::Trained { samples: 5 }
        );
        assert!(matches!(
            coordinator.submit(reading("M1", 5)).await,
            Outcome::Scored { .. }
        ));

        let status = coordinator.status("M1").await.unwrap();
        assert_eq!(status.phase, Phase::Trained);
        assert_eq!(status.sample_count, 6);
        assert_eq!(status.baseline_samples, 5);
        assert!(!status.model.unwrap().restored);
    }

    #[tokio::test]
    async fn test_malformed_never_reaches_worker() {
        let coordinator = coordinator(&quick_config());
        let mut bad = reading("M1", 0);
        bad.vibration = f64::NAN;
        assert!(matches!(coordinator.submit(bad).await, Outcome::Rejected { .. }));
        assert!(coordinator.status("M1").await.is_none());

        let stats = coordinator.stats().await;
        assert_eq!(stats.total_readings, 1);
        assert_eq!(stats.malformed_readings, 1);
        assert_eq!(stats.machines_monitored, 0);
    }

    #[tokio::test]
    async fn test_decode_rejects_garbage() {
        assert!(Coordinator::decode(b"not json").is_err());
        assert!(Coordinator::decode(br#"{"machine_id":"M1"}"#).is_err());
    }

    #[tokio::test]
    async fn test_topic_machine_mismatch_is_malformed() {
        let coordinator = coordinator(&quick_config());
        let payload = serde_json::to_vec(&reading("M2", 0)).unwrap();
        coordinator
            .ingest(Message {
                topic: topics::sensors("factory", "M1"),
                payload: payload.into(),
            })
            .await;
        let stats = coordinator.stats().await;
        assert_eq!(stats.malformed_readings, 1);
        assert_eq!(stats.machines_monitored, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut config = quick_config();
        config.engine.history_len = 3;
        let coordinator = coordinator(&config);
        for i in 0..7 {
            coordinator.submit(reading("M1", i)).await;
        }
        let history = coordinator.history("M1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].temperature, reading("M1", 6).temperature);
        assert!(coordinator.history("nope").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readings_cross_the_boundary_once() {
        let mut config = quick_config();
        config.engine.min_training_samples = 30;
        let coordinator = coordinator(&config);

        let mut tasks = Vec::new();
        for t in 0..6 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    coordinator.dispatch(reading("M1", t * 10 + i)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Status is queued behind every dispatched reading.
        let status = coordinator.status("M1").await.unwrap();
        assert_eq!(status.phase, Phase::Trained);
        assert_eq!(status.sample_count, 60);
        assert_eq!(status.baseline_samples, 30);

        let stats = coordinator.stats().await;
        assert_eq!(stats.models_trained, 1);
        assert_eq!(stats.buffered_readings, 30);
        assert_eq!(stats.scored_readings, 30);
        assert_eq!(stats.scoring_failures, 0);
        assert_eq!(stats.overflowed_readings, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking_other_machines() {
        let mut config = quick_config();
        config.engine.queue_depth = 1;
        let coordinator = coordinator(&config);

        // The worker cannot run before this task yields, so its queue of one
        // fills on the first reading.
        coordinator.dispatch(reading("M1", 0)).await;
        let outcome = coordinator.submit(reading("M1", 1)).await;
        assert!(matches!(outcome, Outcome::Rejected { .. }));

        assert_eq!(
            coordinator.submit(reading("M2", 0)).await,
            Outcome::Buffered { samples: 1, needed: 5 }
        );

        let status = coordinator.status("M1").await.unwrap();
        assert_eq!(status.sample_count, 1);
        let stats = coordinator.stats().await;
        assert_eq!(stats.overflowed_readings, 1);
        assert_eq!(stats.malformed_readings, 0);
    }
}
