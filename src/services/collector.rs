use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::CollectorConfig;
use crate::entities::metric::{self, Entity as MetricEntity, EntityKind, MetricType};
use crate::errors::ServiceError;

/// Current stock position of one product, as reported by the business store.
#[derive(Debug, Clone)]
pub struct StockObservation {
    pub product_id: i64,
    pub name: String,
    pub on_hand: f64,
    pub critical_level: Option<f64>,
}

/// A single numeric reading for an entity (room consumption, task interval,
/// fulfillment delay, scan count).
#[derive(Debug, Clone)]
pub struct EntityObservation {
    pub entity_id: i64,
    pub name: Option<String>,
    pub value: f64,
}

/// Custody position of one staff member, both percentages of assigned stock.
#[derive(Debug, Clone)]
pub struct CustodyObservation {
    pub staff_id: i64,
    pub name: Option<String>,
    pub usage_percent: f64,
    pub shrinkage_percent: f64,
}

/// One ledger movement, signed: receipts positive, issues negative.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub transaction_id: i64,
    pub product_id: i64,
    pub delta: f64,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
}

/// Read side of the business state this subsystem samples. The relational
/// storage of products, rooms, and staff lives with a collaborator; each
/// method is one bulk query per collection pass.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn stock_levels(&self) -> Result<Vec<StockObservation>, ServiceError>;
    async fn room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError>;
    async fn task_completion_intervals(&self) -> Result<Vec<EntityObservation>, ServiceError>;
    async fn custody_positions(&self) -> Result<Vec<CustodyObservation>, ServiceError>;
    async fn vacant_room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError>;
    async fn fulfillment_delays(&self) -> Result<Vec<EntityObservation>, ServiceError>;
    async fn scan_counts_24h(&self) -> Result<Vec<EntityObservation>, ServiceError>;
    /// Ledger movements strictly newer than the cutoff, oldest first.
    async fn transactions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>, ServiceError>;
}

/// Outcome of one collection pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct CollectionReport {
    pub written: usize,
    pub skipped: usize,
    /// Categories or entities that errored; they never abort the pass.
    pub failures: usize,
    pub by_category: Vec<(String, usize)>,
    /// True when the wall-clock budget expired before every category ran.
    pub truncated: bool,
}

impl CollectionReport {
    fn category(&mut self, name: &str, written: usize) {
        self.by_category.push((name.to_string(), written));
        self.written += written;
    }
}

/// Samples business state into append-only metric rows.
///
/// Three disciplines keep repeated invocation cheap and idempotent: a dedup
/// window around candidate timestamps, change-gated sampling for slow signals
/// (stock), and an incremental transaction scan anchored on a marker metric.
#[derive(Clone)]
pub struct DataCollector {
    db: Arc<DatabaseConnection>,
    source: Arc<dyn MetricSource>,
    config: CollectorConfig,
}

impl DataCollector {
    pub fn new(
        db: Arc<DatabaseConnection>,
        source: Arc<dyn MetricSource>,
        config: CollectorConfig,
    ) -> Self {
        Self { db, source, config }
    }

    /// Run every collection category once. A failing category is counted and
    /// skipped; the soft wall-clock budget stops the pass cleanly between
    /// entities.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<CollectionReport, ServiceError> {
        let started = Instant::now();
        let budget = std::time::Duration::from_secs(self.config.pass_budget_secs);
        let mut report = CollectionReport::default();

        type Step<'a> = (
            &'a str,
            std::pin::Pin<
                Box<
                    dyn std::future::Future<Output = Result<(usize, usize), ServiceError>>
                        + Send
                        + 'a,
                >,
            >,
        );
        let steps: Vec<Step<'_>> = vec![
            ("stock", Box::pin(self.collect_stock(started, budget))),
            (
                "consumption",
                Box::pin(self.collect_simple(
                    MetricType::ConsumptionRate,
                    EntityKind::Room,
                    self.source.room_consumption_24h(),
                )),
            ),
            (
                "task_duration",
                Box::pin(self.collect_simple(
                    MetricType::TaskDuration,
                    EntityKind::Staff,
                    self.source.task_completion_intervals(),
                )),
            ),
            ("custody", Box::pin(self.collect_custody())),
            (
                "vacant_consumption",
                Box::pin(self.collect_simple(
                    MetricType::VacantConsumption,
                    EntityKind::Room,
                    self.source.vacant_room_consumption_24h(),
                )),
            ),
            (
                "fulfillment",
                Box::pin(self.collect_simple(
                    MetricType::FulfillmentDelay,
                    EntityKind::Room,
                    self.source.fulfillment_delays(),
                )),
            ),
            (
                "scan_frequency",
                Box::pin(self.collect_simple(
                    MetricType::ScanFrequency,
                    EntityKind::Staff,
                    self.source.scan_counts_24h(),
                )),
            ),
            ("transactions", Box::pin(self.collect_transactions())),
        ];

        for (name, step) in steps {
            if started.elapsed() >= budget {
                warn!(category = name, "collection budget expired before category");
                report.truncated = true;
                break;
            }
            match step.await {
                Ok((written, skipped)) => {
                    report.category(name, written);
                    report.skipped += skipped;
                }
                Err(e) => {
                    warn!(category = name, error = %e, "collection category failed");
                    report.failures += 1;
                }
            }
        }

        info!(
            written = report.written,
            skipped = report.skipped,
            failures = report.failures,
            truncated = report.truncated,
            "collection pass finished"
        );
        Ok(report)
    }

    /// Stock levels are change-gated: a product is re-sampled only when its
    /// level moved by more than the configured epsilon since the last row.
    async fn collect_stock(
        &self,
        started: Instant,
        budget: std::time::Duration,
    ) -> Result<(usize, usize), ServiceError> {
        let observations = self.source.stock_levels().await?;
        let now = Utc::now();
        let mut written = 0;
        let mut skipped = 0;

        for obs in observations {
            if started.elapsed() >= budget {
                warn!("collection budget expired, stopping stock scan after current entity");
                break;
            }
            match self.collect_one_stock(&obs, now).await {
                Ok(true) => written += 1,
                Ok(false) => skipped += 1,
                Err(e) => {
                    warn!(product_id = obs.product_id, error = %e, "stock sample failed");
                }
            }
        }
        Ok((written, skipped))
    }

    async fn collect_one_stock(
        &self,
        obs: &StockObservation,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        if self
            .is_duplicate(MetricType::StockLevel, obs.product_id, now)
            .await?
        {
            return Ok(false);
        }

        let last = self.last_value(MetricType::StockLevel, obs.product_id).await?;
        if let Some(ref last) = last {
            if (last.value - obs.on_hand).abs() <= self.config.change_epsilon {
                debug!(product_id = obs.product_id, "stock unchanged, not re-sampled");
                return Ok(false);
            }
        }

        let delta = obs.on_hand - last.as_ref().map(|l| l.value).unwrap_or(0.0);
        let row = metric::ActiveModel {
            metric_type: Set(MetricType::StockLevel.as_str().to_string()),
            entity_kind: Set(EntityKind::Product.as_str().to_string()),
            entity_id: Set(obs.product_id),
            value: Set(obs.on_hand),
            timestamp: Set(now),
            extra: Set(Some(json!({
                "name": obs.name,
                "critical_level": obs.critical_level,
                "delta": delta,
            }))),
            ..Default::default()
        };
        row.insert(self.db.as_ref()).await?;
        Ok(true)
    }

    /// Dedup-window-gated collection for the plain per-entity readings.
    async fn collect_simple(
        &self,
        metric_type: MetricType,
        entity_kind: EntityKind,
        fetch: impl std::future::Future<Output = Result<Vec<EntityObservation>, ServiceError>>,
    ) -> Result<(usize, usize), ServiceError> {
        let observations = fetch.await?;
        let now = Utc::now();
        let mut written = 0;
        let mut skipped = 0;

        for obs in observations {
            if self.is_duplicate(metric_type, obs.entity_id, now).await? {
                skipped += 1;
                continue;
            }
            let row = metric::ActiveModel {
                metric_type: Set(metric_type.as_str().to_string()),
                entity_kind: Set(entity_kind.as_str().to_string()),
                entity_id: Set(obs.entity_id),
                value: Set(obs.value),
                timestamp: Set(now),
                extra: Set(obs.name.as_ref().map(|name| json!({ "name": name }))),
                ..Default::default()
            };
            match row.insert(self.db.as_ref()).await {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(metric_type = %metric_type, entity_id = obs.entity_id, error = %e, "metric insert failed");
                }
            }
        }
        Ok((written, skipped))
    }

    /// Custody positions produce two series per staff member: usage and
    /// shrinkage, both percentages.
    async fn collect_custody(&self) -> Result<(usize, usize), ServiceError> {
        let observations = self.source.custody_positions().await?;
        let now = Utc::now();
        let mut written = 0;
        let mut skipped = 0;

        for obs in observations {
            for (metric_type, value) in [
                (MetricType::CustodyUsage, obs.usage_percent),
                (MetricType::CustodyShrinkage, obs.shrinkage_percent),
            ] {
                if self.is_duplicate(metric_type, obs.staff_id, now).await? {
                    skipped += 1;
                    continue;
                }
                let row = metric::ActiveModel {
                    metric_type: Set(metric_type.as_str().to_string()),
                    entity_kind: Set(EntityKind::Staff.as_str().to_string()),
                    entity_id: Set(obs.staff_id),
                    value: Set(value),
                    timestamp: Set(now),
                    extra: Set(obs.name.as_ref().map(|name| json!({ "name": name }))),
                    ..Default::default()
                };
                match row.insert(self.db.as_ref()).await {
                    Ok(_) => written += 1,
                    Err(e) => {
                        warn!(staff_id = obs.staff_id, error = %e, "custody metric insert failed");
                    }
                }
            }
        }
        Ok((written, skipped))
    }

    /// Incremental ledger scan. The cutoff lives in a `collection_marker`
    /// system row, so every run processes only movements newer than the last
    /// run and a double-fired scheduler re-processes nothing.
    async fn collect_transactions(&self) -> Result<(usize, usize), ServiceError> {
        let cutoff = match self.last_value(MetricType::CollectionMarker, 0).await? {
            Some(marker) => marker.timestamp,
            None => Utc::now() - ChronoDuration::hours(self.config.initial_scan_hours),
        };

        let transactions = self.source.transactions_since(cutoff).await?;
        let mut written = 0;

        for txn in &transactions {
            let row = metric::ActiveModel {
                metric_type: Set(MetricType::StockMovement.as_str().to_string()),
                entity_kind: Set(EntityKind::Product.as_str().to_string()),
                entity_id: Set(txn.product_id),
                value: Set(txn.delta),
                // Movement rows carry the transaction time, not the scan time.
                timestamp: Set(txn.occurred_at),
                extra: Set(Some(json!({
                    "transaction_id": txn.transaction_id,
                    "kind": txn.kind,
                }))),
                ..Default::default()
            };
            match row.insert(self.db.as_ref()).await {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(transaction_id = txn.transaction_id, error = %e, "movement insert failed");
                }
            }
        }

        let marker = metric::ActiveModel {
            metric_type: Set(MetricType::CollectionMarker.as_str().to_string()),
            entity_kind: Set(EntityKind::System.as_str().to_string()),
            entity_id: Set(0),
            value: Set(written as f64),
            timestamp: Set(Utc::now()),
            extra: Set(Some(json!({
                "cutoff": cutoff.to_rfc3339(),
                "new_transactions": written,
            }))),
            ..Default::default()
        };
        marker.insert(self.db.as_ref()).await?;

        debug!(cutoff = %cutoff, written, "incremental transaction scan finished");
        Ok((written, 0))
    }

    async fn is_duplicate(
        &self,
        metric_type: MetricType,
        entity_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let window = ChronoDuration::minutes(self.config.dedup_window_mins);
        let count = MetricEntity::find()
            .filter(metric::Column::MetricType.eq(metric_type.as_str()))
            .filter(metric::Column::EntityId.eq(entity_id))
            .filter(metric::Column::Timestamp.gte(at - window))
            .filter(metric::Column::Timestamp.lte(at + window))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    async fn last_value(
        &self,
        metric_type: MetricType,
        entity_id: i64,
    ) -> Result<Option<metric::Model>, ServiceError> {
        let row = MetricEntity::find()
            .filter(metric::Column::MetricType.eq(metric_type.as_str()))
            .filter(metric::Column::EntityId.eq(entity_id))
            .order_by_desc(metric::Column::Timestamp)
            .order_by_desc(metric::Column::Id)
            .one(self.db.as_ref())
            .await?;
        Ok(row)
    }

    /// Retention: purge metric rows older than the horizon, marker and
    /// store-op samples included.
    #[instrument(skip(self))]
    pub async fn cleanup_old_metrics(&self, days: i64) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let result = MetricEntity::delete_many()
            .filter(metric::Column::Timestamp.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected > 0 {
            info!(deleted = result.rows_affected, days, "old metrics purged");
        }
        Ok(result.rows_affected)
    }
}
