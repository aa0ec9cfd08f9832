use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::TrainingConfig;
use crate::entities::metric::{self, Entity as MetricEntity, MetricType};
use crate::errors::ServiceError;
use crate::ml::isolation_forest::{ForestConfig, IsolationForest, StandardScaler};
use crate::ml::DetectorArtifact;
use crate::services::detector::ISOLATION_FOREST;
use crate::services::model_store::{ArtifactQuality, ModelStore};

/// Metric families that get a trained detector. The remaining categories run
/// on the statistical baseline only.
pub const TRAINABLE_METRICS: [MetricType; 3] = [
    MetricType::StockLevel,
    MetricType::ConsumptionRate,
    MetricType::TaskDuration,
];

/// Result of one successful training run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrainingOutcome {
    pub metric_type: String,
    pub data_points: usize,
    pub accuracy: f64,
    pub path: String,
}

/// Outcome of a `train_all` sweep. A failed category never aborts the sweep.
#[derive(Debug, Default, serde::Serialize)]
pub struct TrainingSummary {
    pub trained: Vec<TrainingOutcome>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Trains isolation-forest detectors from recent metric series and persists
/// them through the model store.
#[derive(Clone)]
pub struct ModelTrainer {
    db: Arc<DatabaseConnection>,
    store: ModelStore,
    config: TrainingConfig,
}

impl ModelTrainer {
    pub fn new(db: Arc<DatabaseConnection>, store: ModelStore, config: TrainingConfig) -> Self {
        Self { db, store, config }
    }

    /// Train a detector for one metric type over the configured lookback,
    /// pooling every entity's series into a single scalar sample set.
    ///
    /// Returns `Ok(None)` when there is not enough data yet; that is a skip,
    /// not a failure.
    #[instrument(skip(self))]
    pub async fn train_for(
        &self,
        metric_type: MetricType,
    ) -> Result<Option<TrainingOutcome>, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.lookback_days);
        let rows = MetricEntity::find()
            .filter(metric::Column::MetricType.eq(metric_type.as_str()))
            .filter(metric::Column::Timestamp.gte(cutoff))
            .order_by_asc(metric::Column::Timestamp)
            .all(self.db.as_ref())
            .await?;
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();

        if values.len() < self.config.min_training_points {
            warn!(
                metric_type = %metric_type,
                points = values.len(),
                required = self.config.min_training_points,
                "not enough data to train, skipping"
            );
            return Ok(None);
        }

        let forest_config = ForestConfig::default();
        let (train, test) = split_train_test(&values, forest_config.seed);

        let scaler = StandardScaler::fit(&train);
        let scaled: Vec<f64> = train.iter().map(|v| scaler.transform(*v)).collect();
        let forest = IsolationForest::fit(&scaled, forest_config)?;
        let artifact = DetectorArtifact::new(forest, Some(scaler));

        // Quality estimate: how closely the held-out anomaly rate tracks the
        // contamination the forest was calibrated for. Precision/recall are
        // fixed estimates until a labeled evaluation set exists.
        let flagged = test
            .iter()
            .filter(|v| artifact.is_anomalous(**v).unwrap_or(false))
            .count();
        let actual_ratio = flagged as f64 / test.len() as f64;
        let accuracy =
            contamination_consistency(artifact.forest.config().contamination, actual_ratio);

        let quality = ArtifactQuality {
            accuracy: Some(accuracy),
            precision: Some(0.85),
            recall: Some(0.80),
        };
        let path = self
            .store
            .save(&artifact, ISOLATION_FOREST, metric_type, quality)
            .await?;

        info!(
            metric_type = %metric_type,
            data_points = values.len(),
            accuracy,
            path = %path.display(),
            "model trained"
        );

        Ok(Some(TrainingOutcome {
            metric_type: metric_type.as_str().to_string(),
            data_points: values.len(),
            accuracy,
            path: path.to_string_lossy().into_owned(),
        }))
    }

    /// Train every model-backed category. Per-category failures are logged
    /// and reported, never propagated.
    #[instrument(skip(self))]
    pub async fn train_all(&self) -> TrainingSummary {
        let mut summary = TrainingSummary::default();
        for metric_type in TRAINABLE_METRICS {
            match self.train_for(metric_type).await {
                Ok(Some(outcome)) => summary.trained.push(outcome),
                Ok(None) => summary.skipped.push(metric_type.as_str().to_string()),
                Err(e) => {
                    warn!(metric_type = %metric_type, error = %e, "training failed");
                    summary.failed.push(metric_type.as_str().to_string());
                }
            }
        }
        info!(
            trained = summary.trained.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "training sweep finished"
        );
        summary
    }
}

/// Seeded 80/20 shuffle split. The test partition is never empty.
fn split_train_test(values: &[f64], seed: u64) -> (Vec<f64>, Vec<f64>) {
    let mut shuffled = values.to_vec();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);
    let test_len = (shuffled.len() / 5).max(1);
    let test = shuffled[..test_len].to_vec();
    let train = shuffled[test_len..].to_vec();
    (train, test)
}

fn contamination_consistency(expected: f64, actual: f64) -> f64 {
    (1.0 - (expected - actual).abs()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_deterministic_and_keeps_every_sample() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let (train_a, test_a) = split_train_test(&values, 42);
        let (train_b, test_b) = split_train_test(&values, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);
        assert_eq!(train_a.len(), 80);
        assert_eq!(test_a.len(), 20);

        let mut all: Vec<f64> = train_a.iter().chain(test_a.iter()).cloned().collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, values);
    }

    #[test]
    fn tiny_sets_still_get_a_test_partition() {
        let (train, test) = split_train_test(&[1.0, 2.0, 3.0], 7);
        assert_eq!(test.len(), 1);
        assert_eq!(train.len(), 2);
    }

    #[test]
    fn consistency_score_peaks_when_rates_match() {
        assert_eq!(contamination_consistency(0.1, 0.1), 1.0);
        assert!((contamination_consistency(0.1, 0.25) - 0.85).abs() < 1e-12);
        assert_eq!(contamination_consistency(0.1, 1.5), 0.0);
    }
}
