use sea_orm::error::DbErr;
use serde::Serialize;

/// Errors raised by the collection, detection, alerting, and model-store
/// services.
///
/// The four artifact variants (`ArtifactNotFound`, `ArtifactCorrupt`,
/// `ArtifactLoad`, `Inference`) are the classified fallback triggers: the
/// detector catches them, falls back to the statistical strategy, and counts
/// them per cause. `Security` and `DiskQuotaExceeded` abort the single
/// operation that raised them and are never downgraded.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    /// Series too short to evaluate. A skip condition, not a failure.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Model artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Model artifact corrupt: {0}")]
    ArtifactCorrupt(String),

    #[error("Model artifact load failed: {0}")]
    ArtifactLoad(String),

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Model store quota exceeded: {0}")]
    DiskQuotaExceeded(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl ServiceError {
    /// Whether this error causes the detector to fall back to the
    /// statistical strategy rather than fail the detection call.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound(_)
                | Self::ArtifactCorrupt(_)
                | Self::ArtifactLoad(_)
                | Self::Inference(_)
        )
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::Database(error.into_db_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_triggers_cover_exactly_the_artifact_variants() {
        assert!(ServiceError::ArtifactNotFound("x".into()).triggers_fallback());
        assert!(ServiceError::ArtifactCorrupt("x".into()).triggers_fallback());
        assert!(ServiceError::ArtifactLoad("x".into()).triggers_fallback());
        assert!(ServiceError::Inference("x".into()).triggers_fallback());

        assert!(!ServiceError::Security("x".into()).triggers_fallback());
        assert!(!ServiceError::DiskQuotaExceeded("x".into()).triggers_fallback());
        assert!(!ServiceError::InsufficientData("x".into()).triggers_fallback());
        assert!(!ServiceError::db_error("boom").triggers_fallback());
    }
}
