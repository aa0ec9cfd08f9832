#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use tempfile::TempDir;

use stockwatch::config::AppConfig;
use stockwatch::db::{self, DbConfig};
use stockwatch::entities::alert::Severity;
use stockwatch::entities::metric::{self, EntityKind, MetricType};
use stockwatch::errors::ServiceError;
use stockwatch::services::alerts::AlertService;
use stockwatch::services::collector::{
    CustodyObservation, DataCollector, EntityObservation, LedgerTransaction, MetricSource,
    StockObservation,
};
use stockwatch::services::detector::AnomalyDetector;
use stockwatch::services::model_store::ModelStore;
use stockwatch::services::monitor::Monitor;
use stockwatch::services::notifications::{NotificationError, NotificationSink};

/// Test harness: in-memory SQLite, a temp model-store root, a recording
/// notification sink, and zero-delay retry backoff.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub store: ModelStore,
    pub alerts: AlertService,
    pub sink: Arc<RecordingSink>,
    _model_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let model_dir = TempDir::new().expect("failed to create model dir");

        let mut config = AppConfig::new("sqlite::memory:");
        config.model_store.root = model_dir.path().to_string_lossy().into_owned();
        config.model_store.backoff_base_ms = 0;
        config.notifications.operations_recipients = vec!["ops@example.com".to_string()];
        config.notifications.inventory_recipients = vec!["inventory@example.com".to_string()];

        // In-memory SQLite: every connection is its own database, so the
        // pool must stay at exactly one.
        let db_config = DbConfig {
            url: config.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(5),
        };
        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");
        let db = Arc::new(pool);

        let store = ModelStore::new(db.clone(), &config.model_store)
            .expect("failed to create model store");
        let sink = Arc::new(RecordingSink::default());
        let alerts = AlertService::new(db.clone(), sink.clone(), config.notifications.clone());

        Self {
            db,
            config,
            store,
            alerts,
            sink,
            _model_dir: model_dir,
        }
    }

    pub fn detector(&self) -> AnomalyDetector {
        AnomalyDetector::new(
            self.db.clone(),
            self.store.clone(),
            self.alerts.clone(),
            self.config.detection.clone(),
        )
    }

    pub fn collector(&self, source: Arc<dyn MetricSource>) -> DataCollector {
        DataCollector::new(self.db.clone(), source, self.config.collector.clone())
    }

    pub fn monitor(&self, source: Arc<dyn MetricSource>) -> Monitor {
        Monitor::new(
            self.db.clone(),
            source,
            self.sink.clone(),
            self.config.clone(),
        )
        .expect("failed to assemble monitor")
    }

    /// Insert one metric row backdated by `minutes_ago`.
    pub async fn insert_metric(
        &self,
        metric_type: MetricType,
        entity_kind: EntityKind,
        entity_id: i64,
        value: f64,
        minutes_ago: i64,
    ) -> metric::Model {
        let row = metric::ActiveModel {
            metric_type: Set(metric_type.as_str().to_string()),
            entity_kind: Set(entity_kind.as_str().to_string()),
            entity_id: Set(entity_id),
            value: Set(value),
            timestamp: Set(Utc::now() - ChronoDuration::minutes(minutes_ago)),
            extra: Set(None),
            ..Default::default()
        };
        row.insert(self.db.as_ref()).await.expect("metric insert")
    }

    /// Insert an hourly series ending now, oldest value first.
    pub async fn insert_series(
        &self,
        metric_type: MetricType,
        entity_kind: EntityKind,
        entity_id: i64,
        values: &[f64],
    ) {
        for (idx, value) in values.iter().enumerate() {
            let minutes_ago = ((values.len() - 1 - idx) * 60) as i64;
            self.insert_metric(metric_type, entity_kind, entity_id, *value, minutes_ago)
                .await;
        }
    }
}

/// Records deliveries; recipients listed in `failing` error instead.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(String, String, Severity)>>,
    pub failing: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().unwrap().push(recipient.to_string());
    }

    pub fn recipients(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(recipient, _, _)| recipient.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(
        &self,
        recipient: &str,
        subject: &str,
        _body: &str,
        severity: Severity,
        _metadata: &Value,
    ) -> Result<(), NotificationError> {
        if self.failing.lock().unwrap().iter().any(|r| r == recipient) {
            return Err(NotificationError::Delivery {
                recipient: recipient.to_string(),
                reason: "simulated outage".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((recipient.to_string(), subject.to_string(), severity));
        Ok(())
    }
}

/// Canned business state for collector tests.
#[derive(Default)]
pub struct FakeMetricSource {
    pub stock: Vec<StockObservation>,
    pub consumption: Vec<EntityObservation>,
    pub task_intervals: Vec<EntityObservation>,
    pub custody: Vec<CustodyObservation>,
    pub vacant: Vec<EntityObservation>,
    pub fulfillment: Vec<EntityObservation>,
    pub scans: Vec<EntityObservation>,
    pub transactions: Vec<LedgerTransaction>,
    pub fail_consumption: bool,
}

#[async_trait]
impl MetricSource for FakeMetricSource {
    async fn stock_levels(&self) -> Result<Vec<StockObservation>, ServiceError> {
        Ok(self.stock.clone())
    }

    async fn room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        if self.fail_consumption {
            return Err(ServiceError::Internal("simulated source outage".into()));
        }
        Ok(self.consumption.clone())
    }

    async fn task_completion_intervals(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(self.task_intervals.clone())
    }

    async fn custody_positions(&self) -> Result<Vec<CustodyObservation>, ServiceError> {
        Ok(self.custody.clone())
    }

    async fn vacant_room_consumption_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(self.vacant.clone())
    }

    async fn fulfillment_delays(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(self.fulfillment.clone())
    }

    async fn scan_counts_24h(&self) -> Result<Vec<EntityObservation>, ServiceError> {
        Ok(self.scans.clone())
    }

    async fn transactions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>, ServiceError> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| t.occurred_at > cutoff)
            .cloned()
            .collect())
    }
}
