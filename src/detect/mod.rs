//! Anomaly detection: baseline accumulation, the isolation forest, model
//! persistence and severity classification.

pub mod baseline;
pub mod forest;
pub mod persist;
pub mod severity;

use crate::telemetry::Sensor;
use std::fmt;
use thiserror::Error;

pub use self::baseline::{BaselineBuffer, BufferState};
pub use self::forest::{ForestParams, IsolationForest};
pub use self::persist::{ModelStore, PersistedModel};
pub use self::severity::{SafetyRule, SeverityClassifier, SeverityThresholds, GENERIC_FACTOR};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("malformed reading from '{machine_id}': {reason}")]
    MalformedReading { machine_id: String, reason: String },

    #[error("insufficient training data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("model scored before it was fitted")]
    ModelNotTrained,

    #[error("model schema mismatch: persisted layout {found:?}, extractor layout {expected:?}")]
    ModelSchemaMismatch {
        expected: Vec<Sensor>,
        found: Vec<Sensor>,
    },

    #[error("feature vector has {found} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid feature layout: {0}")]
    InvalidLayout(String),

    #[error("corrupt model artifact: {0}")]
    CorruptModel(String),

    #[error("model store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("model codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Severity tiers for scored readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Only WARNING and CRITICAL readings become alerts.
    pub fn is_alerting(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}
