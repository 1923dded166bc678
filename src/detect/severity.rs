//! Severity classification: a statistical tier from the anomaly score plus
//! rule-based contributing factors from the raw sensor values.
//!
//! The two halves are independent pure functions; [`SeverityClassifier::classify`]
//! composes them.

use crate::detect::Severity;
use crate::telemetry::{FeatureVector, Sensor};
use serde::{Deserialize, Serialize};

/// Factor reported when the ensemble flags a reading but no single sensor
/// crosses its safety limit.
pub const GENERIC_FACTOR: &str = "Multivariate pattern deviation";

/// Score cut-offs: `score < critical` is CRITICAL, `critical <= score < warning`
/// is WARNING, anything else is INFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub critical: f64,
    pub warning: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: -0.5,
            warning: -0.3,
        }
    }
}

impl SeverityThresholds {
    pub fn tier(&self, score: f64) -> Severity {
        // NaN compares false everywhere; treat it as the worst case.
        if score.is_nan() || score < self.critical {
            Severity::Critical
        } else if score < self.warning {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Above,
    Below,
}

/// A physical safety limit on one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub sensor: Sensor,
    pub bound: Bound,
    pub limit: f64,
    pub message: String,
}

impl SafetyRule {
    pub fn new(sensor: Sensor, bound: Bound, limit: f64, message: impl Into<String>) -> Self {
        Self {
            sensor,
            bound,
            limit,
            message: message.into(),
        }
    }

    /// Rules on sensors missing from the vector's layout never fire.
    pub fn fires(&self, vector: &FeatureVector) -> bool {
        match (vector.get(self.sensor), self.bound) {
            (Some(v), Bound::Above) => v > self.limit,
            (Some(v), Bound::Below) => v < self.limit,
            (None, _) => false,
        }
    }

    pub fn defaults() -> Vec<SafetyRule> {
        vec![
            SafetyRule::new(
                Sensor::Temperature,
                Bound::Above,
                80.0,
                "Temperature exceeds safe threshold",
            ),
            SafetyRule::new(Sensor::Vibration, Bound::Above, 4.0, "Excessive vibration detected"),
            SafetyRule::new(Sensor::Current, Bound::Above, 15.0, "High current draw"),
            SafetyRule::new(Sensor::Rpm, Bound::Below, 1400.0, "RPM below optimal range"),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    thresholds: SeverityThresholds,
    rules: Vec<SafetyRule>,
}

impl Default for SeverityClassifier {
    fn default() -> Self {
        Self::new(SeverityThresholds::default(), SafetyRule::defaults())
    }
}

impl SeverityClassifier {
    pub fn new(thresholds: SeverityThresholds, rules: Vec<SafetyRule>) -> Self {
        Self { thresholds, rules }
    }

    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    pub fn tier(&self, score: f64) -> Severity {
        self.thresholds.tier(score)
    }

    /// Messages of every safety rule the vector violates, in rule order.
    pub fn factors(&self, vector: &FeatureVector) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.fires(vector))
            .map(|rule| rule.message.clone())
            .collect()
    }

    /// Severity tier plus recommendation factors. Alerting tiers always carry
    /// at least one factor.
    pub fn classify(&self, score: f64, vector: &FeatureVector) -> (Severity, Vec<String>) {
        let severity = self.tier(score);
        let mut factors = self.factors(vector);
        if factors.is_empty() && severity.is_alerting() {
            factors.push(GENERIC_FACTOR.to_string());
        }
        (severity, factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{FeatureExtractor, Reading};
    use chrono::Utc;

    fn vector(t: f64, v: f64, c: f64, rpm: f64) -> FeatureVector {
        FeatureExtractor::default()
            .extract(&Reading::new("M1", Utc::now(), t, v, c, 6.0, rpm))
            .unwrap()
    }

    #[test]
    fn test_tier_boundaries() {
        let t = SeverityThresholds::default();
        assert_eq!(t.tier(-0.9), Severity::Critical);
        assert_eq!(t.tier(-0.500_000_1), Severity::Critical);
        assert_eq!(t.tier(-0.5), Severity::Warning);
        assert_eq!(t.tier(-0.4), Severity::Warning);
        assert_eq!(t.tier(-0.300_000_1), Severity::Warning);
        assert_eq!(t.tier(-0.3), Severity::Info);
        assert_eq!(t.tier(0.0), Severity::Info);
        assert_eq!(t.tier(0.8), Severity::Info);
    }

    #[test]
    fn test_tier_is_total() {
        let t = SeverityThresholds::default();
        assert_eq!(t.tier(f64::NAN), Severity::Critical);
        assert_eq!(t.tier(f64::NEG_INFINITY), Severity::Critical);
        assert_eq!(t.tier(f64::INFINITY), Severity::Info);
    }

    #[test]
    fn test_factors_follow_rule_order() {
        let classifier = SeverityClassifier::default();
        let factors = classifier.factors(&vector(95.0, 5.0, 16.0, 1300.0));
        assert_eq!(
            factors,
            vec![
                "Temperature exceeds safe threshold",
                "Excessive vibration detected",
                "High current draw",
                "RPM below optimal range",
            ]
        );
        assert!(classifier.factors(&vector(65.0, 2.0, 10.0, 1500.0)).is_empty());
    }

    #[test]
    fn test_generic_factor_only_when_alerting() {
        let classifier = SeverityClassifier::default();
        let normal = vector(65.0, 2.0, 10.0, 1500.0);

        let (severity, factors) = classifier.classify(-0.4, &normal);
        assert_eq!(severity, Severity::Warning);
        assert_eq!(factors, vec![GENERIC_FACTOR]);

        let (severity, factors) = classifier.classify(0.1, &normal);
        assert_eq!(severity, Severity::Info);
        assert!(factors.is_empty());
    }

    #[test]
    fn test_rule_on_missing_sensor_never_fires() {
        let extractor = FeatureExtractor::new(vec![Sensor::Vibration]).unwrap();
        let v = extractor
            .extract(&Reading::new("M1", Utc::now(), 120.0, 2.0, 10.0, 6.0, 1500.0))
            .unwrap();
        assert!(SeverityClassifier::default().factors(&v).is_empty());
    }
}
