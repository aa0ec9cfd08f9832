use chrono::Duration as ChronoDuration;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::entities::alert::{self, AlertType, NewAlert, Severity};
use crate::entities::metric::{EntityKind, MetricType};
use crate::errors::ServiceError;
use crate::ml::trainer::{ModelTrainer, TrainingSummary};
use crate::services::alerts::{AlertService, AlertStatistics};
use crate::services::collector::{CollectionReport, DataCollector, MetricSource};
use crate::services::detector::{AnomalyDetector, DetectionReport, FallbackStats};
use crate::services::model_store::{CleanupReport, ModelInfo, ModelStore, PerformanceStats};
use crate::services::notifications::SharedSink;

/// Aggregate health of the model-based detection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Session-level fallback accounting exposed to collaborators.
#[derive(Debug, serde::Serialize)]
pub struct FallbackHealth {
    pub total: u64,
    pub fallback_count: u64,
    pub fallback_rate: f64,
    pub status: HealthStatus,
    pub missing_artifact: u64,
    pub corrupt_artifact: u64,
    pub load_error: u64,
    pub inference_error: u64,
}

/// Outcome of a full cleanup pass across alerts, metrics, and artifacts.
#[derive(Debug, serde::Serialize)]
pub struct CleanupSummary {
    pub alerts_deleted: u64,
    pub metrics_deleted: u64,
    pub models: CleanupReport,
}

/// Facade over the scheduled passes: collection, detection, training,
/// cleanup, and the alert/model listings the admin layer consumes.
///
/// Holds the session-scoped fallback aggregate. Each detection pass runs with
/// its own tracker which is merged here at the reporting boundary, then the
/// escalation rule is evaluated against the aggregate.
pub struct Monitor {
    collector: DataCollector,
    detector: AnomalyDetector,
    alerts: AlertService,
    store: ModelStore,
    trainer: ModelTrainer,
    config: AppConfig,
    session_stats: Mutex<FallbackStats>,
}

impl Monitor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        source: Arc<dyn MetricSource>,
        sink: SharedSink,
        config: AppConfig,
    ) -> Result<Self, ServiceError> {
        let store = ModelStore::new(db.clone(), &config.model_store)?;
        let alerts = AlertService::new(db.clone(), sink, config.notifications.clone());
        let detector = AnomalyDetector::new(
            db.clone(),
            store.clone(),
            alerts.clone(),
            config.detection.clone(),
        );
        let collector = DataCollector::new(db.clone(), source, config.collector.clone());
        let trainer = ModelTrainer::new(db, store.clone(), config.training.clone());
        Ok(Self {
            collector,
            detector,
            alerts,
            store,
            trainer,
            config,
            session_stats: Mutex::new(FallbackStats::default()),
        })
    }

    /// One collection pass. Returns the number of metrics written.
    pub async fn run_collection(&self) -> Result<CollectionReport, ServiceError> {
        self.collector.run().await
    }

    /// One detection pass over every category, then fold the pass tracker
    /// into the session aggregate and evaluate the escalation rule.
    #[instrument(skip(self))]
    pub async fn run_detection_pass(&self) -> Result<DetectionReport, ServiceError> {
        let mut tracker = FallbackStats::default();
        let report = self.detector.run_pass(&mut tracker).await?;

        let aggregate = {
            let mut stats = self.session_stats.lock().await;
            stats.merge(&tracker);
            *stats
        };
        self.maybe_escalate(&aggregate).await?;

        Ok(report)
    }

    /// Raise one critical system alert when the session fallback ratio
    /// crosses the configured threshold over a meaningful sample, at most
    /// once per dedup window.
    async fn maybe_escalate(&self, stats: &FallbackStats) -> Result<(), ServiceError> {
        let cfg = &self.config.detection;
        if stats.attempts < cfg.fallback_min_attempts || stats.ratio() <= cfg.fallback_alert_ratio
        {
            return Ok(());
        }

        let window = ChronoDuration::hours(cfg.fallback_alert_dedup_hours);
        if self
            .alerts
            .recent_exists(AlertType::ModelFallbackDegraded, 0, window)
            .await?
        {
            return Ok(());
        }

        let rate_percent = stats.ratio() * 100.0;
        let threshold_percent = cfg.fallback_alert_ratio * 100.0;
        warn!(
            attempts = stats.attempts,
            fallbacks = stats.fallbacks,
            rate_percent,
            "model fallback rate degraded, raising system alert"
        );
        self.alerts
            .create(NewAlert {
                alert_type: AlertType::ModelFallbackDegraded,
                severity: Severity::Critical,
                entity_kind: EntityKind::System,
                entity_id: 0,
                metric_value: rate_percent,
                expected_value: threshold_percent,
                deviation_percent: (rate_percent - threshold_percent) / threshold_percent * 100.0,
                message: format!(
                    "Model fallback rate is {rate_percent:.0}% over {} detection attempts (threshold {threshold_percent:.0}%)",
                    stats.attempts
                ),
                suggested_action: Some(
                    "Review the model training pipeline and artifact store; detection is running on the statistical fallback."
                        .to_string(),
                ),
            })
            .await?;
        Ok(())
    }

    /// Session fallback totals with the health band they map to.
    pub async fn fallback_health(&self) -> FallbackHealth {
        let cfg = &self.config.detection;
        let stats = *self.session_stats.lock().await;
        let ratio = stats.ratio();

        let status = if stats.attempts >= cfg.fallback_min_attempts
            && ratio > cfg.fallback_alert_ratio
        {
            HealthStatus::Critical
        } else if stats.attempts >= cfg.fallback_min_attempts && ratio > cfg.fallback_warn_ratio {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        };

        FallbackHealth {
            total: stats.attempts,
            fallback_count: stats.fallbacks,
            fallback_rate: ratio,
            status,
            missing_artifact: stats.missing_artifact,
            corrupt_artifact: stats.corrupt_artifact,
            load_error: stats.load_error,
            inference_error: stats.inference_error,
        }
    }

    pub async fn list_active_alerts(
        &self,
        severity: Option<Severity>,
        limit: Option<usize>,
    ) -> Result<Vec<alert::Model>, ServiceError> {
        self.alerts.active(severity, limit).await
    }

    pub async fn mark_read(&self, alert_id: i64, actor: &str) -> Result<bool, ServiceError> {
        self.alerts.mark_read(alert_id, actor).await
    }

    pub async fn mark_false_positive(
        &self,
        alert_id: i64,
        actor: &str,
    ) -> Result<bool, ServiceError> {
        self.alerts.mark_false_positive(alert_id, actor).await
    }

    pub async fn alert_statistics(&self, days: i64) -> Result<AlertStatistics, ServiceError> {
        self.alerts.statistics(days).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceError> {
        self.store.list().await
    }

    pub async fn model_info(
        &self,
        model_type: &str,
        metric_type: MetricType,
    ) -> Result<Option<ModelInfo>, ServiceError> {
        self.store.info(model_type, metric_type).await
    }

    pub async fn cleanup_models(
        &self,
        keep_versions: usize,
    ) -> Result<CleanupReport, ServiceError> {
        self.store.cleanup(keep_versions).await
    }

    pub async fn store_performance(&self, hours: i64) -> Result<PerformanceStats, ServiceError> {
        self.store.performance_stats(hours).await
    }

    pub async fn train_models(&self) -> TrainingSummary {
        self.trainer.train_all().await
    }

    /// Full retention pass: read alerts, old metrics, surplus artifacts.
    #[instrument(skip(self))]
    pub async fn run_cleanup(
        &self,
        keep_versions: Option<usize>,
    ) -> Result<CleanupSummary, ServiceError> {
        let alerts_deleted = self.alerts.cleanup(self.config.alert_retention_days).await?;
        let metrics_deleted = self
            .collector
            .cleanup_old_metrics(self.config.collector.metric_retention_days)
            .await?;
        let models = self
            .store
            .cleanup(keep_versions.unwrap_or(self.config.model_store.keep_versions))
            .await?;

        let summary = CleanupSummary {
            alerts_deleted,
            metrics_deleted,
            models,
        };
        info!(
            alerts = summary.alerts_deleted,
            metrics = summary.metrics_deleted,
            model_rows = summary.models.deleted_rows,
            "cleanup pass finished"
        );
        Ok(summary)
    }
}
