use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared by every machine worker and the outbox.
#[derive(Debug, Default)]
pub struct EngineStats {
    readings: AtomicU64,
    malformed: AtomicU64,
    overflowed: AtomicU64,
    buffered: AtomicU64,
    scored: AtomicU64,
    scoring_failures: AtomicU64,
    models_trained: AtomicU64,
    models_restored: AtomicU64,
    persist_failures: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_published: AtomicU64,
    alerts_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Readings,
    Malformed,
    /// Reading dropped because its machine's queue was full.
    Overflowed,
    Buffered,
    Scored,
    /// A TRAINED machine failed to score a valid reading.
    ScoringFailed,
    ModelsTrained,
    ModelsRestored,
    PersistFailed,
    AlertsEmitted,
    AlertsPublished,
    AlertsDropped,
}

impl EngineStats {
    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Readings => &self.readings,
            Counter::Malformed => &self.malformed,
            Counter::Overflowed => &self.overflowed,
            Counter::Buffered => &self.buffered,
            Counter::Scored => &self.scored,
            Counter::ScoringFailed => &self.scoring_failures,
            Counter::ModelsTrained => &self.models_trained,
            Counter::ModelsRestored => &self.models_restored,
            Counter::PersistFailed => &self.persist_failures,
            Counter::AlertsEmitted => &self.alerts_emitted,
            Counter::AlertsPublished => &self.alerts_published,
            Counter::AlertsDropped => &self.alerts_dropped,
        }
    }

    pub(crate) fn incr(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, machines: usize) -> StatsSnapshot {
        let load = |c| self.counter(c).load(Ordering::Relaxed);
        let readings = load(Counter::Readings);
        let alerts = load(Counter::AlertsEmitted);
        StatsSnapshot {
            total_readings: readings,
            malformed_readings: load(Counter::Malformed),
            overflowed_readings: load(Counter::Overflowed),
            buffered_readings: load(Counter::Buffered),
            scored_readings: load(Counter::Scored),
            scoring_failures: load(Counter::ScoringFailed),
            anomalies_detected: alerts,
            anomaly_rate: if readings == 0 {
                0.0
            } else {
                alerts as f64 / readings as f64
            },
            alerts_published: load(Counter::AlertsPublished),
            alerts_dropped: load(Counter::AlertsDropped),
            models_trained: load(Counter::ModelsTrained),
            models_restored: load(Counter::ModelsRestored),
            persist_failures: load(Counter::PersistFailed),
            machines_monitored: machines,
        }
    }
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_readings: u64,
    pub malformed_readings: u64,
    pub overflowed_readings: u64,
    pub buffered_readings: u64,
    pub scored_readings: u64,
    pub scoring_failures: u64,
    pub anomalies_detected: u64,
    pub anomaly_rate: f64,
    pub alerts_published: u64,
    pub alerts_dropped: u64,
    pub models_trained: u64,
    pub models_restored: u64,
    pub persist_failures: u64,
    pub machines_monitored: usize,
}
