use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};

use super::metric::EntityKind;

/// Alert severity. The derived `Ord` gives `Low < Medium < High < Critical`,
/// which is what the active-alert listing sorts by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Classify a deviation percentage (absolute value) into a severity band.
    pub fn from_deviation(deviation_percent: f64) -> Self {
        let abs = deviation_percent.abs();
        if abs < 30.0 {
            Severity::Low
        } else if abs < 50.0 {
            Severity::Medium
        } else if abs < 80.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of alerts the detector raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    StockAnomaly,
    ConsumptionAnomaly,
    TaskDelay,
    CustodyShrinkage,
    VacantConsumption,
    FulfillmentDelay,
    ScanFrequencyAnomaly,
    /// System-scoped: model fallback rate crossed the escalation threshold.
    ModelFallbackDegraded,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::StockAnomaly => "stock_anomaly",
            AlertType::ConsumptionAnomaly => "consumption_anomaly",
            AlertType::TaskDelay => "task_delay",
            AlertType::CustodyShrinkage => "custody_shrinkage",
            AlertType::VacantConsumption => "vacant_consumption",
            AlertType::FulfillmentDelay => "fulfillment_delay",
            AlertType::ScanFrequencyAnomaly => "scan_frequency_anomaly",
            AlertType::ModelFallbackDegraded => "model_fallback_degraded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stock_anomaly" => Some(AlertType::StockAnomaly),
            "consumption_anomaly" => Some(AlertType::ConsumptionAnomaly),
            "task_delay" => Some(AlertType::TaskDelay),
            "custody_shrinkage" => Some(AlertType::CustodyShrinkage),
            "vacant_consumption" => Some(AlertType::VacantConsumption),
            "fulfillment_delay" => Some(AlertType::FulfillmentDelay),
            "scan_frequency_anomaly" => Some(AlertType::ScanFrequencyAnomaly),
            "model_fallback_degraded" => Some(AlertType::ModelFallbackDegraded),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected anomaly with its lifecycle state.
///
/// Lifecycle invariants: `is_false_positive` is terminal (the row is excluded
/// from active and statistics views permanently); unread alerts are never
/// deleted, cleanup only removes read alerts past the retention horizon.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "alerts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub alert_type: String,
    pub severity: String,
    pub entity_kind: String,
    pub entity_id: i64,
    pub metric_value: f64,
    pub expected_value: f64,
    pub deviation_percent: f64,
    pub message: String,
    pub suggested_action: Option<String>,
    pub is_read: bool,
    pub is_false_positive: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn severity(&self) -> Severity {
        Severity::from_str(&self.severity).unwrap_or(Severity::Low)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}

/// A draft alert produced by a detection pass, before persistence.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub metric_value: f64,
    pub expected_value: f64,
    pub deviation_percent: f64,
    pub message: String,
    pub suggested_action: Option<String>,
}
