/*!
 * Isolation forest over one-dimensional samples.
 *
 * Each tree isolates points by recursive random splits; anomalies sit on
 * short paths. The anomaly score follows Liu et al.:
 * `s(x) = 2^(−E[h(x)] / c(n))`, with `c(n)` the expected path length of an
 * unsuccessful BST search. The decision threshold is calibrated at fit time
 * from the training-score quantile implied by the contamination rate, so the
 * serialized model carries everything needed to label a point.
 */

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Training hyperparameters. Defaults mirror the production training job:
/// 100 trees, 256-point subsamples, 10% expected contamination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub subsample: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            subsample: 256,
            contamination: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A fitted isolation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Node>,
    /// Subsample size actually used (bounded by the training set).
    sample_size: usize,
    /// Scores at or above this value are labeled anomalous.
    threshold: f64,
    config: ForestConfig,
}

/// Average path length of an unsuccessful BST search over `n` points.
fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    // Harmonic number approximation: H(k) ~ ln(k) + Euler–Mascheroni.
    let h = (n - 1.0).ln() + 0.577_215_664_9;
    2.0 * h - 2.0 * (n - 1.0) / n
}

fn build_tree(samples: &mut [f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if samples.len() <= 1 || depth >= max_depth {
        return Node::Leaf {
            size: samples.len(),
        };
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return Node::Leaf {
            size: samples.len(),
        };
    }

    let split = rng.gen_range(min..max);
    let pivot = partition_below(samples, split);
    let (left_slice, right_slice) = samples.split_at_mut(pivot);
    Node::Split {
        value: split,
        left: Box::new(build_tree(left_slice, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(right_slice, depth + 1, max_depth, rng)),
    }
}

/// In-place partition: values below `split` to the front, returns the pivot.
fn partition_below(samples: &mut [f64], split: f64) -> usize {
    let mut pivot = 0;
    for i in 0..samples.len() {
        if samples[i] < split {
            samples.swap(i, pivot);
            pivot += 1;
        }
    }
    pivot
}

fn path_length(node: &Node, x: f64, depth: f64) -> f64 {
    match node {
        Node::Leaf { size } => depth + c_factor(*size),
        Node::Split { value, left, right } => {
            if x < *value {
                path_length(left, x, depth + 1.0)
            } else {
                path_length(right, x, depth + 1.0)
            }
        }
    }
}

impl IsolationForest {
    /// Fit a forest on the given samples. Needs at least 8 points; fewer is
    /// an `InsufficientData` condition for the caller to skip, not an error
    /// to surface.
    pub fn fit(values: &[f64], config: ForestConfig) -> Result<Self, ServiceError> {
        if values.len() < 8 {
            return Err(ServiceError::InsufficientData(format!(
                "isolation forest needs at least 8 samples, got {}",
                values.len()
            )));
        }
        if !(0.0..0.5).contains(&config.contamination) {
            return Err(ServiceError::Validation(format!(
                "contamination must be in [0, 0.5), got {}",
                config.contamination
            )));
        }

        let sample_size = config.subsample.min(values.len()).max(2);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut trees = Vec::with_capacity(config.n_trees);
        for _ in 0..config.n_trees {
            let mut subsample: Vec<f64> = (0..sample_size)
                .map(|_| values[rng.gen_range(0..values.len())])
                .collect();
            trees.push(build_tree(&mut subsample, 0, max_depth, &mut rng));
        }

        let mut forest = Self {
            trees,
            sample_size,
            threshold: 0.5,
            config,
        };

        // Calibrate the decision threshold so roughly `contamination` of the
        // training set scores above it.
        let mut scores: Vec<f64> = values.iter().map(|&v| forest.score(v)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let cut = ((1.0 - forest.config.contamination) * (scores.len() - 1) as f64).round() as usize;
        forest.threshold = scores[cut.min(scores.len() - 1)];

        Ok(forest)
    }

    /// Anomaly score in [0, 1]; higher means more isolated.
    pub fn score(&self, x: f64) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, x, 0.0))
            .sum();
        let avg_path = total / self.trees.len() as f64;
        let c = c_factor(self.sample_size);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg_path / c)
    }

    pub fn is_anomalous(&self, x: f64) -> bool {
        self.score(x) >= self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }
}

/// Standardizes inputs to zero mean and unit variance, matching training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: f64,
    pub std: f64,
}

impl StandardScaler {
    pub fn fit(values: &[f64]) -> Self {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        Self {
            mean,
            std: if std > 0.0 { std } else { 1.0 },
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_data() -> Vec<f64> {
        // Low-discrepancy jitter spread uniformly over [10, 11).
        (0..400)
            .map(|i| 10.0 + (i as f64 * 0.618_033_988_7).fract())
            .collect()
    }

    #[test]
    fn outlier_scores_higher_than_inlier() {
        let forest = IsolationForest::fit(&training_data(), ForestConfig::default()).unwrap();
        assert!(forest.score(500.0) > forest.score(10.5));
    }

    #[test]
    fn far_outlier_is_labeled_anomalous() {
        let forest = IsolationForest::fit(&training_data(), ForestConfig::default()).unwrap();
        assert!(forest.is_anomalous(500.0));
        assert!(!forest.is_anomalous(10.5));
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let a = IsolationForest::fit(&training_data(), ForestConfig::default()).unwrap();
        let b = IsolationForest::fit(&training_data(), ForestConfig::default()).unwrap();
        assert_eq!(a.threshold(), b.threshold());
        assert_eq!(a.score(42.0), b.score(42.0));
    }

    #[test]
    fn tiny_training_sets_are_insufficient() {
        let err = IsolationForest::fit(&[1.0, 2.0, 3.0], ForestConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ServiceError::InsufficientData(_)
        ));
    }

    #[test]
    fn scaler_normalizes_and_survives_zero_variance() {
        let scaler = StandardScaler::fit(&[10.0, 12.0, 8.0, 10.0]);
        assert!(scaler.transform(scaler.mean).abs() < 1e-9);

        let flat = StandardScaler::fit(&[5.0, 5.0, 5.0]);
        assert_eq!(flat.std, 1.0);
        assert_eq!(flat.transform(5.0), 0.0);
    }
}
