use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};

/// Kinds of metrics collected from business state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Current on-hand stock per product.
    StockLevel,
    /// Signed per-transaction stock delta (incremental scan output).
    StockMovement,
    /// 24h consumption total per room.
    ConsumptionRate,
    /// Mean interval between completed refill tasks per staff member, minutes.
    TaskDuration,
    /// Time from a guest request to its completion, minutes.
    FulfillmentDelay,
    /// Share of custody stock a staff member has used, percent.
    CustodyUsage,
    /// Share of custody stock lost (neither used nor returned), percent.
    CustodyShrinkage,
    /// Consumption recorded for a room with no registered guest.
    VacantConsumption,
    /// Successful inventory scans per staff member over 24h.
    ScanFrequency,
    /// System marker: last processed transaction cutoff.
    CollectionMarker,
    /// System sample: model store operation timing.
    StoreOpDuration,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::StockLevel => "stock_level",
            MetricType::StockMovement => "stock_movement",
            MetricType::ConsumptionRate => "consumption_rate",
            MetricType::TaskDuration => "task_duration",
            MetricType::FulfillmentDelay => "fulfillment_delay",
            MetricType::CustodyUsage => "custody_usage",
            MetricType::CustodyShrinkage => "custody_shrinkage",
            MetricType::VacantConsumption => "vacant_consumption",
            MetricType::ScanFrequency => "scan_frequency",
            MetricType::CollectionMarker => "collection_marker",
            MetricType::StoreOpDuration => "store_op_duration",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stock_level" => Some(MetricType::StockLevel),
            "stock_movement" => Some(MetricType::StockMovement),
            "consumption_rate" => Some(MetricType::ConsumptionRate),
            "task_duration" => Some(MetricType::TaskDuration),
            "fulfillment_delay" => Some(MetricType::FulfillmentDelay),
            "custody_usage" => Some(MetricType::CustodyUsage),
            "custody_shrinkage" => Some(MetricType::CustodyShrinkage),
            "vacant_consumption" => Some(MetricType::VacantConsumption),
            "scan_frequency" => Some(MetricType::ScanFrequency),
            "collection_marker" => Some(MetricType::CollectionMarker),
            "store_op_duration" => Some(MetricType::StoreOpDuration),
            _ => None,
        }
    }

    /// Metrics that can never legitimately go below zero. A negative
    /// observation is a structural invariant violation, not an outlier.
    pub fn is_non_negative(&self) -> bool {
        matches!(self, MetricType::StockLevel)
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subject a metric describes. `System` entities always use id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Product,
    Room,
    Staff,
    System,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Room => "room",
            EntityKind::Staff => "staff",
            EntityKind::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "product" => Some(EntityKind::Product),
            "room" => Some(EntityKind::Room),
            "staff" => Some(EntityKind::Staff),
            "system" => Some(EntityKind::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable observation. Rows are append-only: nothing mutates a metric
/// after it is written, and a series for (metric_type, entity_id) is read in
/// timestamp order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "metrics")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub metric_type: String,
    pub entity_kind: String,
    pub entity_id: i64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Diagnostic context only; never consulted by detection logic.
    pub extra: Option<Json>,
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
        if let ActiveValue::NotSet = active_model.timestamp {
            active_model.timestamp = Set(Utc::now());
        }
        Ok(active_model)
    }
}
