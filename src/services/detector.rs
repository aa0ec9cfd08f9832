use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{DetectionConfig, ProfileConfig};
use crate::entities::alert::{AlertType, NewAlert, Severity};
use crate::entities::metric::{self, Entity as MetricEntity, EntityKind, MetricType};
use crate::errors::ServiceError;
use crate::services::alerts::AlertService;
use crate::services::model_store::ModelStore;

/// The only trained model family this subsystem ships.
pub const ISOLATION_FOREST: &str = "isolation_forest";

/// Result of evaluating the latest point of a series. Both scoring
/// strategies return this same shape, so severity and alert logic downstream
/// never care which strategy ran.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub is_anomaly: bool,
    pub score: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Why a model-based call fell back to the statistical strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackCause {
    MissingArtifact,
    CorruptArtifact,
    LoadError,
    InferenceError,
}

impl FallbackCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackCause::MissingArtifact => "missing_artifact",
            FallbackCause::CorruptArtifact => "corrupt_artifact",
            FallbackCause::LoadError => "load_error",
            FallbackCause::InferenceError => "inference_error",
        }
    }
}

/// Per-pass fallback accounting. Owned by the caller of a detection pass and
/// merged into the session aggregate at the reporting boundary; never global
/// state.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct FallbackStats {
    pub attempts: u64,
    pub fallbacks: u64,
    pub missing_artifact: u64,
    pub corrupt_artifact: u64,
    pub load_error: u64,
    pub inference_error: u64,
}

impl FallbackStats {
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_fallback(&mut self, cause: FallbackCause) {
        self.fallbacks += 1;
        match cause {
            FallbackCause::MissingArtifact => self.missing_artifact += 1,
            FallbackCause::CorruptArtifact => self.corrupt_artifact += 1,
            FallbackCause::LoadError => self.load_error += 1,
            FallbackCause::InferenceError => self.inference_error += 1,
        }
    }

    pub fn merge(&mut self, other: &FallbackStats) {
        self.attempts += other.attempts;
        self.fallbacks += other.fallbacks;
        self.missing_artifact += other.missing_artifact;
        self.corrupt_artifact += other.corrupt_artifact;
        self.load_error += other.load_error;
        self.inference_error += other.inference_error;
    }

    pub fn ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.attempts as f64
        }
    }

    pub fn count(&self, cause: FallbackCause) -> u64 {
        match cause {
            FallbackCause::MissingArtifact => self.missing_artifact,
            FallbackCause::CorruptArtifact => self.corrupt_artifact,
            FallbackCause::LoadError => self.load_error,
            FallbackCause::InferenceError => self.inference_error,
        }
    }
}

/// Outcome of one detection pass.
#[derive(Debug, Default, Serialize)]
pub struct DetectionReport {
    pub alerts_by_category: Vec<(String, usize)>,
    pub total: usize,
    /// True when the wall-clock budget expired before every entity was seen.
    pub truncated: bool,
}

/// Z-score evaluation of the latest point against its history.
///
/// The baseline (mean, sample stddev) is computed over everything before the
/// latest point; the candidate never dilutes its own reference distribution.
/// Fewer than 3 points or zero spread never flags. The score is the absolute
/// z-score of the latest value.
pub fn evaluate_zscore(values: &[f64], threshold: f64) -> Detection {
    if values.len() < 3 {
        return Detection {
            is_anomaly: false,
            score: 0.0,
            mean: 0.0,
            stddev: 0.0,
        };
    }
    let (mean, stddev) = baseline(values);
    if stddev == 0.0 {
        return Detection {
            is_anomaly: false,
            score: 0.0,
            mean,
            stddev: 0.0,
        };
    }
    let latest = values[values.len() - 1];
    let score = ((latest - mean) / stddev).abs();
    Detection {
        is_anomaly: score > threshold,
        score,
        mean,
        stddev,
    }
}

/// Mean and sample standard deviation of the series history, excluding the
/// latest point. Callers guarantee at least 3 points, so the history always
/// has the 2 points sample variance needs.
fn baseline(values: &[f64]) -> (f64, f64) {
    let history = &values[..values.len() - 1];
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Both,
    Above,
    Below,
}

impl Direction {
    fn parse(s: &str) -> Self {
        match s {
            "above" => Direction::Above,
            "below" => Direction::Below,
            _ => Direction::Both,
        }
    }

    fn admits(&self, above_mean: bool) -> bool {
        match self {
            Direction::Both => true,
            Direction::Above => above_mean,
            Direction::Below => !above_mean,
        }
    }
}

/// One detection category: a metric series family plus its tuning profile.
struct Category {
    name: &'static str,
    metric_type: MetricType,
    alert_type: AlertType,
    entity_kind: EntityKind,
    profile: ProfileConfig,
}

fn categories(config: &DetectionConfig) -> Vec<Category> {
    vec![
        Category {
            name: "stock",
            metric_type: MetricType::StockLevel,
            alert_type: AlertType::StockAnomaly,
            entity_kind: EntityKind::Product,
            profile: config.stock.clone(),
        },
        Category {
            name: "consumption",
            metric_type: MetricType::ConsumptionRate,
            alert_type: AlertType::ConsumptionAnomaly,
            entity_kind: EntityKind::Room,
            profile: config.consumption.clone(),
        },
        Category {
            name: "task_duration",
            metric_type: MetricType::TaskDuration,
            alert_type: AlertType::TaskDelay,
            entity_kind: EntityKind::Staff,
            profile: config.task_duration.clone(),
        },
        Category {
            name: "custody_shrinkage",
            metric_type: MetricType::CustodyShrinkage,
            alert_type: AlertType::CustodyShrinkage,
            entity_kind: EntityKind::Staff,
            profile: config.custody_shrinkage.clone(),
        },
        Category {
            name: "occupancy_mismatch",
            metric_type: MetricType::VacantConsumption,
            alert_type: AlertType::VacantConsumption,
            entity_kind: EntityKind::Room,
            profile: config.occupancy_mismatch.clone(),
        },
        Category {
            name: "request_latency",
            metric_type: MetricType::FulfillmentDelay,
            alert_type: AlertType::FulfillmentDelay,
            entity_kind: EntityKind::Room,
            profile: config.request_latency.clone(),
        },
        Category {
            name: "scan_frequency",
            metric_type: MetricType::ScanFrequency,
            alert_type: AlertType::ScanFrequencyAnomaly,
            entity_kind: EntityKind::Staff,
            profile: config.scan_frequency.clone(),
        },
    ]
}

/// Classifies the latest value of each metric series as anomalous, using the
/// trained model when one is available and the z-score baseline otherwise.
/// All failure modes of the model path degrade transparently to the baseline
/// and are counted on the caller's tracker.
#[derive(Clone)]
pub struct AnomalyDetector {
    db: Arc<DatabaseConnection>,
    store: ModelStore,
    alerts: AlertService,
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: ModelStore,
        alerts: AlertService,
        config: DetectionConfig,
    ) -> Self {
        Self {
            db,
            store,
            alerts,
            config,
        }
    }

    /// Model-based evaluation with transparent fallback.
    ///
    /// Every call counts one attempt. Artifact failures are classified,
    /// counted, and answered with the statistical strategy; errors that are
    /// not fallback triggers (security, database) abort this single call.
    pub async fn detect_with_model(
        &self,
        metric_type: MetricType,
        values: &[f64],
        threshold: f64,
        tracker: &mut FallbackStats,
    ) -> Result<Detection, ServiceError> {
        tracker.record_attempt();

        if values.len() < 3 {
            return Ok(evaluate_zscore(values, threshold));
        }

        let artifact = match self.store.load(ISOLATION_FOREST, metric_type).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                tracker.record_fallback(FallbackCause::MissingArtifact);
                return Ok(evaluate_zscore(values, threshold));
            }
            Err(e) if e.triggers_fallback() => {
                let cause = match &e {
                    ServiceError::ArtifactNotFound(_) => FallbackCause::MissingArtifact,
                    ServiceError::ArtifactCorrupt(_) => FallbackCause::CorruptArtifact,
                    ServiceError::Inference(_) => FallbackCause::InferenceError,
                    _ => FallbackCause::LoadError,
                };
                warn!(metric_type = %metric_type, cause = cause.as_str(), error = %e, "model path failed, using statistical fallback");
                tracker.record_fallback(cause);
                return Ok(evaluate_zscore(values, threshold));
            }
            Err(e) => return Err(e),
        };

        let latest = values[values.len() - 1];
        let (mean, stddev) = baseline(values);
        match artifact.is_anomalous(latest) {
            Ok(is_anomaly) => Ok(Detection {
                is_anomaly,
                score: artifact.score(latest),
                mean,
                stddev,
            }),
            Err(e) => {
                warn!(metric_type = %metric_type, error = %e, "inference failed, using statistical fallback");
                tracker.record_fallback(FallbackCause::InferenceError);
                Ok(evaluate_zscore(values, threshold))
            }
        }
    }

    /// Run every detection category once. Per-entity failures are logged and
    /// skipped; the soft wall-clock budget stops the pass cleanly after the
    /// current entity.
    #[instrument(skip(self, tracker))]
    pub async fn run_pass(
        &self,
        tracker: &mut FallbackStats,
    ) -> Result<DetectionReport, ServiceError> {
        let started = Instant::now();
        let budget = std::time::Duration::from_secs(self.config.pass_budget_secs);
        let mut report = DetectionReport::default();

        for category in categories(&self.config) {
            if started.elapsed() >= budget {
                warn!(category = category.name, "pass budget expired before category");
                report.truncated = true;
                break;
            }
            let created = self
                .run_category(&category, tracker, started, budget, &mut report)
                .await?;
            report
                .alerts_by_category
                .push((category.name.to_string(), created));
            report.total += created;
        }

        info!(
            total = report.total,
            truncated = report.truncated,
            attempts = tracker.attempts,
            fallbacks = tracker.fallbacks,
            "detection pass finished"
        );
        Ok(report)
    }

    async fn run_category(
        &self,
        category: &Category,
        tracker: &mut FallbackStats,
        started: Instant,
        budget: std::time::Duration,
        report: &mut DetectionReport,
    ) -> Result<usize, ServiceError> {
        let lookback = Utc::now() - ChronoDuration::days(category.profile.lookback_days);
        let entity_ids: Vec<i64> = MetricEntity::find()
            .select_only()
            .column(metric::Column::EntityId)
            .filter(metric::Column::MetricType.eq(category.metric_type.as_str()))
            .filter(metric::Column::Timestamp.gte(lookback))
            .distinct()
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        // One catalog probe per category; entities only pay the model-path
        // cost (and its fallback accounting) when an artifact exists at all.
        let model_available = self
            .store
            .info(ISOLATION_FOREST, category.metric_type)
            .await?
            .is_some();

        let mut created = 0;
        for entity_id in entity_ids {
            if started.elapsed() >= budget {
                warn!(
                    category = category.name,
                    "pass budget expired, stopping after current entity"
                );
                report.truncated = true;
                break;
            }
            match self
                .evaluate_entity(category, entity_id, model_available, tracker)
                .await
            {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    // Per-entity isolation: one bad series never aborts the
                    // rest of the pass.
                    warn!(category = category.name, entity_id, error = %e, "entity evaluation failed");
                }
            }
        }

        if created > 0 {
            info!(category = category.name, created, "anomalies detected");
        }
        Ok(created)
    }

    async fn evaluate_entity(
        &self,
        category: &Category,
        entity_id: i64,
        model_available: bool,
        tracker: &mut FallbackStats,
    ) -> Result<bool, ServiceError> {
        let lookback = Utc::now() - ChronoDuration::days(category.profile.lookback_days);
        let rows = MetricEntity::find()
            .filter(metric::Column::MetricType.eq(category.metric_type.as_str()))
            .filter(metric::Column::EntityId.eq(entity_id))
            .filter(metric::Column::Timestamp.gte(lookback))
            .order_by_asc(metric::Column::Timestamp)
            .all(self.db.as_ref())
            .await?;

        let Some(latest_row) = rows.last() else {
            return Ok(false);
        };
        let name = display_name(latest_row, category.entity_kind, entity_id);
        let latest = latest_row.value;
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();

        // Structural invariant: a negative value for a non-negative metric is
        // always critical and bypasses both scoring strategies.
        if category.metric_type.is_non_negative() && latest < 0.0 {
            return self
                .raise_negative_value_alert(category, entity_id, &name, latest)
                .await;
        }

        if values.len() < 3 {
            debug!(
                category = category.name,
                entity_id,
                points = values.len(),
                "insufficient data, skipped"
            );
            return Ok(false);
        }

        let detection = if model_available {
            self.detect_with_model(
                category.metric_type,
                &values,
                category.profile.threshold,
                tracker,
            )
            .await?
        } else {
            evaluate_zscore(&values, category.profile.threshold)
        };

        if !detection.is_anomaly {
            return Ok(false);
        }

        let expected = detection.mean;
        let deviation_percent = if expected > 0.0 {
            (latest - expected) / expected * 100.0
        } else {
            0.0
        };

        let above = latest > expected;
        if !Direction::parse(&category.profile.direction).admits(above) {
            return Ok(false);
        }
        if category.profile.min_deviation_percent > 0.0
            && deviation_percent.abs() < category.profile.min_deviation_percent
        {
            return Ok(false);
        }

        // Dedup is this caller's responsibility, not the alert manager's.
        let window = ChronoDuration::hours(category.profile.dedup_hours);
        if self
            .alerts
            .recent_exists(category.alert_type, entity_id, window)
            .await?
        {
            return Ok(false);
        }

        let (message, suggested_action) =
            compose_message(category.alert_type, &name, latest, expected, deviation_percent);
        self.alerts
            .create(NewAlert {
                alert_type: category.alert_type,
                severity: Severity::from_deviation(deviation_percent),
                entity_kind: category.entity_kind,
                entity_id,
                metric_value: latest,
                expected_value: expected,
                deviation_percent,
                message,
                suggested_action: Some(suggested_action),
            })
            .await?;
        Ok(true)
    }

    async fn raise_negative_value_alert(
        &self,
        category: &Category,
        entity_id: i64,
        name: &str,
        latest: f64,
    ) -> Result<bool, ServiceError> {
        let window = ChronoDuration::hours(category.profile.dedup_hours);
        if self
            .alerts
            .recent_exists(category.alert_type, entity_id, window)
            .await?
        {
            return Ok(false);
        }
        let shortfall = latest.abs();
        self.alerts
            .create(NewAlert {
                alert_type: category.alert_type,
                severity: Severity::Critical,
                entity_kind: category.entity_kind,
                entity_id,
                metric_value: latest,
                expected_value: 0.0,
                deviation_percent: 100.0,
                message: format!(
                    "NEGATIVE STOCK: {name} is at {latest:.0} (issues exceed receipts)"
                ),
                suggested_action: Some(format!(
                    "Audit the stock ledger: {shortfall:.0} units must be re-entered or corrected. Possible data inconsistency."
                )),
            })
            .await?;
        Ok(true)
    }
}

fn display_name(row: &metric::Model, kind: EntityKind, entity_id: i64) -> String {
    row.extra
        .as_ref()
        .and_then(|extra| extra.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", kind.as_str(), entity_id))
}

fn compose_message(
    alert_type: AlertType,
    name: &str,
    current: f64,
    expected: f64,
    deviation_percent: f64,
) -> (String, String) {
    let dev = deviation_percent.abs();
    let above = current > expected;
    match alert_type {
        AlertType::StockAnomaly => {
            if above {
                (
                    format!(
                        "{name} stock level is {dev:.1}% above normal (current: {current:.0}, expected: {expected:.0})"
                    ),
                    "Verify stock counts; possible over-stocking or a mis-posted receipt.".into(),
                )
            } else {
                (
                    format!(
                        "{name} stock level is {dev:.1}% below normal (current: {current:.0}, expected: {expected:.0})"
                    ),
                    "Reorder soon and review the critical threshold.".into(),
                )
            }
        }
        AlertType::ConsumptionAnomaly => {
            if above {
                (
                    format!(
                        "{name} consumption is {dev:.1}% above normal (24h: {current:.0}, average: {expected:.0})"
                    ),
                    "Check the minibar; unusual consumption volume.".into(),
                )
            } else {
                (
                    format!(
                        "{name} consumption is {dev:.1}% below normal (24h: {current:.0}, average: {expected:.0})"
                    ),
                    "Room may be unoccupied or the minibar unused.".into(),
                )
            }
        }
        AlertType::TaskDelay => (
            format!(
                "{name} refill interval is {dev:.1}% longer than normal (current: {current:.0} min, average: {expected:.0} min)"
            ),
            "Follow up with the staff member; possible operational issue.".into(),
        ),
        AlertType::CustodyShrinkage => (
            format!(
                "{name} custody shrinkage is {dev:.1}% above normal ({current:.1}% of assigned stock unaccounted for)"
            ),
            "Reconcile assigned stock against usage records.".into(),
        ),
        AlertType::VacantConsumption => (
            format!("{name} shows consumption while vacant (24h total: {current:.0})"),
            "Audit room access; consumption was recorded without a registered guest.".into(),
        ),
        AlertType::FulfillmentDelay => (
            format!(
                "{name} request fulfillment is {dev:.1}% slower than normal (current: {current:.0} min, average: {expected:.0} min)"
            ),
            "Review request-queue staffing for this area.".into(),
        ),
        AlertType::ScanFrequencyAnomaly => {
            if above {
                (
                    format!(
                        "{name} scan count is {dev:.1}% above normal (24h: {current:.0}, average: {expected:.0})"
                    ),
                    "Confirm scans match actual rounds; duplicates possible.".into(),
                )
            } else {
                (
                    format!(
                        "{name} scan count is {dev:.1}% below normal (24h: {current:.0}, average: {expected:.0})"
                    ),
                    "Confirm rounds are being completed with scans.".into(),
                )
            }
        }
        AlertType::ModelFallbackDegraded => (
            format!("Model fallback rate degraded: {name}"),
            "Review the model training pipeline and artifact store.".into(),
        ),
    }
}
