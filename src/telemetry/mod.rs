//! Sensor telemetry: the reading value object and the fixed sensor catalogue.

pub mod features;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub use self::features::{FeatureExtractor, FeatureVector};

/// One physical channel measured on every machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensor {
    Temperature,
    Vibration,
    Current,
    Pressure,
    Rpm,
}

impl Sensor {
    /// Canonical feature order. Persisted models depend on it.
    pub const ALL: [Sensor; 5] = [
        Sensor::Temperature,
        Sensor::Vibration,
        Sensor::Current,
        Sensor::Pressure,
        Sensor::Rpm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Sensor::Temperature => "temperature",
            Sensor::Vibration => "vibration",
            Sensor::Current => "current",
            Sensor::Pressure => "pressure",
            Sensor::Rpm => "rpm",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Sensor::Temperature => "°C",
            Sensor::Vibration => "mm/s",
            Sensor::Current => "A",
            Sensor::Pressure => "bar",
            Sensor::Rpm => "rpm",
        }
    }

    /// Physically plausible range (inclusive). Values outside it are sensor faults.
    pub fn plausible_range(&self) -> (f64, f64) {
        match self {
            Sensor::Temperature => (-50.0, 250.0),
            Sensor::Vibration => (0.0, 100.0),
            Sensor::Current => (0.0, 500.0),
            Sensor::Pressure => (0.0, 100.0),
            Sensor::Rpm => (0.0, 20_000.0),
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One timestamped multi-sensor observation from one machine.
///
/// Readings arrive as flat JSON records from the telemetry source and are
/// never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub machine_id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    pub current: f64,
    pub pressure: f64,
    pub rpm: f64,
    /// Simulator bookkeeping, ignored by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_level: Option<f64>,
}

impl Reading {
    pub fn new(
        machine_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        temperature: f64,
        vibration: f64,
        current: f64,
        pressure: f64,
        rpm: f64,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            timestamp,
            temperature,
            vibration,
            current,
            pressure,
            rpm,
            runtime_hours: None,
            degradation_level: None,
        }
    }

    pub fn value(&self, sensor: Sensor) -> f64 {
        match sensor {
            Sensor::Temperature => self.temperature,
            Sensor::Vibration => self.vibration,
            Sensor::Current => self.current,
            Sensor::Pressure => self.pressure,
            Sensor::Rpm => self.rpm,
        }
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive ISO-8601 date-time
/// (no offset) which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}
