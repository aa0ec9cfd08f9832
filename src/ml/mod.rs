/*!
 * Detector models.
 *
 * The isolation forest here is the model-based scoring strategy behind the
 * anomaly detector; artifacts serialize the whole `DetectorArtifact` document
 * (forest + optional input scaler) with serde_json and are persisted by the
 * model store.
 */

pub mod isolation_forest;
pub mod trainer;

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use isolation_forest::{IsolationForest, StandardScaler};

/// Serialized payload of a trained detector version. This is the document
/// written to `{model_type}_{metric_type}_{timestamp}.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorArtifact {
    /// Bumped on incompatible payload changes; loads reject unknown versions.
    pub schema_version: u32,
    pub forest: IsolationForest,
    pub scaler: Option<StandardScaler>,
}

pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

impl DetectorArtifact {
    pub fn new(forest: IsolationForest, scaler: Option<StandardScaler>) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            forest,
            scaler,
        }
    }

    /// Label a single observation: `true` means anomalous. The scaler, when
    /// present, normalizes the input exactly as it did at training time.
    pub fn is_anomalous(&self, value: f64) -> Result<bool, ServiceError> {
        let x = match &self.scaler {
            Some(scaler) => scaler.transform(value),
            None => value,
        };
        if !x.is_finite() {
            return Err(ServiceError::Inference(format!(
                "non-finite input after scaling: {x}"
            )));
        }
        Ok(self.forest.is_anomalous(x))
    }

    /// Anomaly score of a single observation in [0, 1].
    pub fn score(&self, value: f64) -> f64 {
        let x = match &self.scaler {
            Some(scaler) => scaler.transform(value),
            None => value,
        };
        self.forest.score(x)
    }
}
