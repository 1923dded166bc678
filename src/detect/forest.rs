//! Isolation forest: an ensemble of random axis-aligned partitions.
//!
//! Points that are isolated after few random splits are anomalous. The
//! published score is `1 - 2 * s(x)` where `s(x) = 2^(-E[h(x)] / c(psi))` is
//! the classic isolation score, so:
//!
//! * `0.0` is the neutral point (`s = 0.5`),
//! * dense inliers score positive,
//! * points isolated immediately approach `-1.0`.
//!
//! Fitting is seeded so the same training set always yields the same forest.
//! Scoring never draws randomness.

use crate::detect::DetectError;
use crate::telemetry::FeatureVector;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Forest hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble.
    pub n_estimators: usize,
    /// Upper bound on the per-tree sub-sample size.
    pub max_samples: usize,
    /// Expected share of anomalies in the training data. Only used to derive
    /// the diagnostic decision threshold.
    pub contamination: f64,
    /// RNG seed for fitting.
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.15,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Fitted {
    trees: Vec<Node>,
    sample_size: usize,
    dimensions: usize,
    threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    params: ForestParams,
    fitted: Option<Fitted>,
}

impl IsolationForest {
    pub fn new(params: ForestParams) -> Self {
        Self { params, fitted: None }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    /// Dimensionality the forest was trained on.
    pub fn dimensions(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.dimensions)
    }

    /// Sub-sample size each tree was grown from.
    pub fn sample_size(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.sample_size)
    }

    /// Score at the `contamination` quantile of the training set.
    pub fn threshold(&self) -> Option<f64> {
        self.fitted.as_ref().map(|f| f.threshold)
    }

    /// Whether `score` falls below the contamination-derived threshold.
    pub fn is_outlier(&self, score: f64) -> Result<bool, DetectError> {
        let fitted = self.fitted.as_ref().ok_or(DetectError::ModelNotTrained)?;
        Ok(score < fitted.threshold)
    }

    /// Grow the ensemble on `vectors`, replacing any previous fit.
    pub fn fit(&mut self, vectors: &[FeatureVector]) -> Result<(), DetectError> {
        if vectors.len() < 2 {
            return Err(DetectError::InsufficientData {
                needed: 2,
                have: vectors.len(),
            });
        }
        let dimensions = vectors[0].len();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(DetectError::DimensionMismatch {
                expected: dimensions,
                found: bad.len(),
            });
        }

        let data: Vec<&[f64]> = vectors.iter().map(|v| v.values()).collect();
        let sample_size = self.params.max_samples.clamp(2, data.len());
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        let trees = (0..self.params.n_estimators.max(1))
            .map(|_| {
                let mut rows = index::sample(&mut rng, data.len(), sample_size).into_vec();
                grow(&data, &mut rows, 0, height_limit, &mut rng)
            })
            .collect();

        let mut fitted = Fitted {
            trees,
            sample_size,
            dimensions,
            threshold: 0.0,
        };
        let mut training_scores: Vec<f64> = data.iter().map(|x| fitted.score(x)).collect();
        training_scores.sort_by(f64::total_cmp);
        let rank = ((training_scores.len() - 1) as f64 * self.params.contamination.clamp(0.0, 1.0))
            .round() as usize;
        fitted.threshold = training_scores[rank];

        self.fitted = Some(fitted);
        Ok(())
    }

    /// Anomaly score in `[-1, 1)`; lower is more anomalous.
    pub fn score(&self, vector: &FeatureVector) -> Result<f64, DetectError> {
        let fitted = self.fitted.as_ref().ok_or(DetectError::ModelNotTrained)?;
        if vector.len() != fitted.dimensions {
            return Err(DetectError::DimensionMismatch {
                expected: fitted.dimensions,
                found: vector.len(),
            });
        }
        Ok(fitted.score(vector.values()))
    }
}

impl Fitted {
    fn score(&self, x: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|tree| path_length(tree, x)).sum();
        let mean = total / self.trees.len() as f64;
        let s = 2f64.powf(-mean / average_path_length(self.sample_size));
        1.0 - 2.0 * s
    }
}

fn grow(data: &[&[f64]], rows: &mut [usize], depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    let dimensions = data[rows[0]].len();
    let spans: Vec<(usize, f64, f64)> = (0..dimensions)
        .filter_map(|feature| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                (lo.min(data[r][feature]), hi.max(data[r][feature]))
            });
            (hi > lo).then_some((feature, lo, hi))
        })
        .collect();

    // Every feature constant: the node cannot be split any further.
    if spans.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = spans[rng.gen_range(0..spans.len())];
    let threshold = rng.gen_range(lo..hi);

    let mut split = 0;
    for k in 0..rows.len() {
        if data[rows[k]][feature] <= threshold {
            rows.swap(k, split);
            split += 1;
        }
    }
    let (left, right) = rows.split_at_mut(split);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(data, left, depth + 1, limit, rng)),
        right: Box::new(grow(data, right, depth + 1, limit, rng)),
    }
}

fn path_length(root: &Node, x: &[f64]) -> f64 {
    let mut node = root;
    let mut depth = 0.0;
    loop {
        match node {
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                node = if x[*feature] <= *threshold { left } else { right };
                depth += 1.0;
            }
            Node::Leaf { size } => return depth + average_path_length(*size),
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{FeatureExtractor, Reading};
    use chrono::Utc;

    fn vector(t: f64, v: f64, c: f64, p: f64, rpm: f64) -> FeatureVector {
        FeatureExtractor::default()
            .extract(&Reading::new("M1", Utc::now(), t, v, c, p, rpm))
            .unwrap()
    }

    fn baseline() -> Vec<FeatureVector> {
        (0..30)
            .map(|i| {
                let i = i as f64;
                vector(
                    65.0 + (i * 0.7).sin(),
                    2.0 + 0.2 * (i * 1.3).sin(),
                    10.0 + 0.3 * (i * 0.9).cos(),
                    6.0 + 0.1 * (i * 2.1).sin(),
                    1500.0 + 20.0 * (i * 0.5).cos(),
                )
            })
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c30 = average_path_length(30);
        assert!(c30 > 5.9 && c30 < 6.0, "c(30) = {}", c30);
    }

    #[test]
    fn test_insufficient_data() {
        let mut forest = IsolationForest::new(ForestParams::default());
        let err = forest.fit(&baseline()[..1]).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientData { needed: 2, have: 1 }));
        assert!(!forest.is_trained());
    }

    #[test]
    fn test_score_before_fit() {
        let forest = IsolationForest::new(ForestParams::default());
        let err = forest.score(&baseline()[0]).unwrap_err();
        assert!(matches!(err, DetectError::ModelNotTrained));
    }

    #[test]
    fn test_seeded_fit_is_reproducible() {
        let mut a = IsolationForest::new(ForestParams::default());
        let mut b = IsolationForest::new(ForestParams::default());
        a.fit(&baseline()).unwrap();
        b.fit(&baseline()).unwrap();
        assert_eq!(a, b);

        let probe = vector(70.0, 2.5, 11.0, 6.1, 1450.0);
        assert_eq!(a.score(&probe).unwrap(), b.score(&probe).unwrap());
        assert_eq!(a.score(&probe).unwrap(), a.score(&probe).unwrap());
    }

    #[test]
    fn test_outlier_scores_lower_than_inlier() {
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&baseline()).unwrap();

        let inlier = forest.score(&vector(65.0, 2.0, 10.0, 6.0, 1500.0)).unwrap();
        let outlier = forest.score(&vector(95.0, 2.0, 18.0, 7.5, 1250.0)).unwrap();
        assert!(outlier < inlier, "outlier {} vs inlier {}", outlier, inlier);
        assert!(outlier < -0.5, "outlier score {}", outlier);
        assert!(inlier >= -0.3, "inlier score {}", inlier);
        assert!(forest.is_outlier(outlier).unwrap());
        assert!((-1.0..1.0).contains(&outlier));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&baseline()).unwrap();
        let short = FeatureExtractor::new(vec![crate::telemetry::Sensor::Temperature])
            .unwrap()
            .extract(&Reading::new("M1", Utc::now(), 65.0, 2.0, 10.0, 6.0, 1500.0))
            .unwrap();
        assert!(matches!(
            forest.score(&short),
            Err(DetectError::DimensionMismatch { expected: 5, found: 1 })
        ));
    }

    #[test]
    fn test_constant_training_set() {
        let same: Vec<_> = (0..10).map(|_| vector(65.0, 2.0, 10.0, 6.0, 1500.0)).collect();
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&same).unwrap();
        // Every tree is a single leaf, so every point scores identically.
        let a = forest.score(&same[0]).unwrap();
        let b = forest.score(&vector(90.0, 9.0, 30.0, 9.0, 900.0)).unwrap();
        assert_eq!(a, b);
    }
}
