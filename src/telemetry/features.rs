//! Reading -> fixed-order numeric feature vector.

use crate::detect::DetectError;
use crate::telemetry::{Reading, Sensor};
use serde::{Deserialize, Serialize};

/// Ordered numeric encoding of a reading, tagged with the layout that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    layout: Vec<Sensor>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn layout(&self) -> &[Sensor] {
        &self.layout
    }

    /// Value of `sensor`, if it is part of this vector's layout.
    pub fn get(&self, sensor: Sensor) -> Option<f64> {
        self.layout
            .iter()
            .position(|s| *s == sensor)
            .map(|i| self.values[i])
    }
}

/// Maps readings onto a configured, duplicate-free sensor layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureExtractor {
    layout: Vec<Sensor>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            layout: Sensor::ALL.to_vec(),
        }
    }
}

impl FeatureExtractor {
    pub fn new(layout: Vec<Sensor>) -> Result<Self, DetectError> {
        if layout.is_empty() {
            return Err(DetectError::InvalidLayout("layout has no sensors".into()));
        }
        for (i, sensor) in layout.iter().enumerate() {
            if layout[..i].contains(sensor) {
                return Err(DetectError::InvalidLayout(format!(
                    "sensor '{}' listed twice",
                    sensor
                )));
            }
        }
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &[Sensor] {
        &self.layout
    }

    pub fn dimensions(&self) -> usize {
        self.layout.len()
    }

    /// Extract the feature vector, rejecting non-finite or implausible values.
    pub fn extract(&self, reading: &Reading) -> Result<FeatureVector, DetectError> {
        if reading.machine_id.trim().is_empty() {
            return Err(DetectError::MalformedReading {
                machine_id: reading.machine_id.clone(),
                reason: "empty machine_id".into(),
            });
        }

        let mut values = Vec::with_capacity(self.layout.len());
        for sensor in &self.layout {
            let value = reading.value(*sensor);
            if !value.is_finite() {
                return Err(DetectError::MalformedReading {
                    machine_id: reading.machine_id.clone(),
                    reason: format!("{} is not a finite number", sensor),
                });
            }
            let (lo, hi) = sensor.plausible_range();
            if value < lo || value > hi {
                return Err(DetectError::MalformedReading {
                    machine_id: reading.machine_id.clone(),
                    reason: format!(
                        "{} = {} {} outside plausible range [{}, {}]",
                        sensor,
                        value,
                        sensor.unit(),
                        lo,
                        hi
                    ),
                });
            }
            values.push(value);
        }

        Ok(FeatureVector {
            layout: self.layout.clone(),
            values,
        })
    }
}
