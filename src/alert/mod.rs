//! Alert records and their delivery.

pub mod emitter;

use crate::detect::Severity;
use crate::telemetry::{FeatureVector, Reading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::emitter::{AlertEmitter, RetryPolicy};

/// One detected anomalous event. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: u64,
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub anomaly_score: f64,
    pub reading_snapshot: ReadingSnapshot,
    pub recommendation: Vec<String>,
}

/// The triggering reading, raw and as the model saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSnapshot {
    pub features: FeatureVector,
    pub reading: Reading,
}

impl Alert {
    /// Single-line maintenance advice for logs and operators.
    pub fn recommendation_text(&self) -> String {
        if self.recommendation.is_empty() {
            "Monitor closely for additional anomalies".to_string()
        } else {
            format!("Schedule inspection: {}", self.recommendation.join("; "))
        }
    }
}
