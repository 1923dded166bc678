use crate::telemetry::{FeatureVector, Sensor};
use serde::Serialize;

/// Result of adding a sample to a [`BaselineBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Accumulating,
    Ready,
}

/// Bounded accumulator of the feature vectors seen before a machine's model
/// is trained. Once frozen it is kept for diagnostics only.
#[derive(Debug, Clone)]
pub struct BaselineBuffer {
    capacity: usize,
    samples: Vec<FeatureVector>,
    frozen: bool,
}

impl BaselineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            frozen: false,
        }
    }

    /// Append a sample. Returns `Ready` once the buffer holds `capacity`
    /// samples; further samples are not stored.
    pub fn add(&mut self, vector: FeatureVector) -> BufferState {
        if !self.frozen && self.samples.len() < self.capacity {
            self.samples.push(vector);
        }
        self.state()
    }

    pub fn state(&self) -> BufferState {
        if self.frozen || self.samples.len() >= self.capacity {
            BufferState::Ready
        } else {
            BufferState::Accumulating
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> &[FeatureVector] {
        &self.samples
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Per-feature mean and standard deviation of the baseline.
    pub fn summary(&self) -> Vec<FeatureSummary> {
        let Some(first) = self.samples.first() else {
            return Vec::new();
        };
        first
            .layout()
            .iter()
            .enumerate()
            .map(|(i, sensor)| {
                let series = Series::new(self.samples.iter().map(|v| v.values()[i]).collect());
                FeatureSummary {
                    sensor: *sensor,
                    mean: series.mean(),
                    std_dev: series.std_dev(),
                }
            })
            .collect()
    }
}

/// Baseline statistics for one feature.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureSummary {
    pub sensor: Sensor,
    pub mean: f64,
    pub std_dev: f64,
}

/// Values of a single feature across the baseline.
struct Series {
    values: Vec<f64>,
}

impl Series {
    fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
