use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::NotificationConfig;
use crate::entities::alert::{self, AlertType, Entity as AlertEntity, NewAlert, Severity};
use crate::errors::ServiceError;
use crate::services::notifications::SharedSink;

/// Aggregate alert statistics over a trailing window.
#[derive(Debug, Default, serde::Serialize)]
pub struct AlertStatistics {
    pub period_days: i64,
    pub total: u64,
    pub unread: u64,
    pub false_positives: u64,
    pub false_positive_rate: f64,
    pub by_severity: HashMap<String, u64>,
    pub by_type: HashMap<String, u64>,
}

/// Manages the alert lifecycle: creation (with notification fan-out),
/// read/false-positive transitions, active listings, statistics, retention.
///
/// Deduplication is the caller's job: the detector checks `recent_exists`
/// before submitting a draft, and this service trusts incoming drafts.
#[derive(Clone)]
pub struct AlertService {
    db: Arc<DatabaseConnection>,
    sink: SharedSink,
    recipients: NotificationConfig,
}

impl AlertService {
    pub fn new(db: Arc<DatabaseConnection>, sink: SharedSink, recipients: NotificationConfig) -> Self {
        Self {
            db,
            sink,
            recipients,
        }
    }

    /// Persist a draft and fan out notifications. Delivery failures are
    /// logged per recipient and never roll back the stored alert.
    #[instrument(skip(self, draft), fields(alert_type = draft.alert_type.as_str(), severity = draft.severity.as_str()))]
    pub async fn create(&self, draft: NewAlert) -> Result<i64, ServiceError> {
        let row = alert::ActiveModel {
            alert_type: Set(draft.alert_type.as_str().to_string()),
            severity: Set(draft.severity.as_str().to_string()),
            entity_kind: Set(draft.entity_kind.as_str().to_string()),
            entity_id: Set(draft.entity_id),
            metric_value: Set(draft.metric_value),
            expected_value: Set(draft.expected_value),
            deviation_percent: Set(draft.deviation_percent),
            message: Set(draft.message.clone()),
            suggested_action: Set(draft.suggested_action.clone()),
            is_read: Set(false),
            is_false_positive: Set(false),
            resolved_at: Set(None),
            resolved_by: Set(None),
            ..Default::default()
        };
        let inserted = row.insert(self.db.as_ref()).await?;
        info!(alert_id = inserted.id, "alert created");

        self.fan_out(&inserted).await;
        Ok(inserted.id)
    }

    /// Critical/high alerts reach operations and inventory recipients;
    /// low/medium reach operations only.
    async fn fan_out(&self, alert: &alert::Model) {
        let severity = alert.severity();
        let mut recipients: Vec<&String> = self.recipients.operations_recipients.iter().collect();
        if severity >= Severity::High {
            recipients.extend(self.recipients.inventory_recipients.iter());
        }

        let subject = format!("[{}] {}", severity.as_str().to_uppercase(), alert.alert_type);
        let metadata = json!({
            "alert_id": alert.id,
            "entity_kind": alert.entity_kind,
            "entity_id": alert.entity_id,
            "deviation_percent": alert.deviation_percent,
        });

        for recipient in recipients {
            if let Err(e) = self
                .sink
                .notify(recipient, &subject, &alert.message, severity, &metadata)
                .await
            {
                warn!(recipient, error = %e, "notification delivery failed");
            }
        }
    }

    /// Dedup guard for detection passes: is there a live alert of this type
    /// for this entity inside the window?
    pub async fn recent_exists(
        &self,
        alert_type: AlertType,
        entity_id: i64,
        window: ChronoDuration,
    ) -> Result<bool, ServiceError> {
        let cutoff = Utc::now() - window;
        let count = AlertEntity::find()
            .filter(alert::Column::AlertType.eq(alert_type.as_str()))
            .filter(alert::Column::EntityId.eq(entity_id))
            .filter(alert::Column::CreatedAt.gte(cutoff))
            .filter(alert::Column::IsFalsePositive.eq(false))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    /// Unread, non-false-positive alerts ordered by severity then recency.
    /// Severity is ranked through the enum, not string collation.
    pub async fn active(
        &self,
        severity: Option<Severity>,
        limit: Option<usize>,
    ) -> Result<Vec<alert::Model>, ServiceError> {
        let mut query = AlertEntity::find()
            .filter(alert::Column::IsRead.eq(false))
            .filter(alert::Column::IsFalsePositive.eq(false));
        if let Some(severity) = severity {
            query = query.filter(alert::Column::Severity.eq(severity.as_str()));
        }
        let mut rows = query
            .order_by_desc(alert::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        rows.sort_by(|a, b| {
            b.severity()
                .cmp(&a.severity())
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Recent alerts including read ones; false positives stay excluded.
    pub async fn all(
        &self,
        days: i64,
        severity: Option<Severity>,
        alert_type: Option<AlertType>,
    ) -> Result<Vec<alert::Model>, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut query = AlertEntity::find()
            .filter(alert::Column::CreatedAt.gte(cutoff))
            .filter(alert::Column::IsFalsePositive.eq(false));
        if let Some(severity) = severity {
            query = query.filter(alert::Column::Severity.eq(severity.as_str()));
        }
        if let Some(alert_type) = alert_type {
            query = query.filter(alert::Column::AlertType.eq(alert_type.as_str()));
        }
        let rows = query
            .order_by_desc(alert::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn mark_read(&self, alert_id: i64, actor: &str) -> Result<bool, ServiceError> {
        let Some(row) = AlertEntity::find_by_id(alert_id).one(self.db.as_ref()).await? else {
            warn!(alert_id, "alert not found");
            return Ok(false);
        };
        let mut update: alert::ActiveModel = row.into();
        update.is_read = Set(true);
        update.resolved_at = Set(Some(Utc::now()));
        update.resolved_by = Set(Some(actor.to_string()));
        update.update(self.db.as_ref()).await?;
        info!(alert_id, actor, "alert marked read");
        Ok(true)
    }

    /// Terminal transition: the alert leaves every active and statistics
    /// view permanently.
    #[instrument(skip(self))]
    pub async fn mark_false_positive(
        &self,
        alert_id: i64,
        actor: &str,
    ) -> Result<bool, ServiceError> {
        let Some(row) = AlertEntity::find_by_id(alert_id).one(self.db.as_ref()).await? else {
            warn!(alert_id, "alert not found");
            return Ok(false);
        };
        let mut update: alert::ActiveModel = row.into();
        update.is_false_positive = Set(true);
        update.is_read = Set(true);
        update.resolved_at = Set(Some(Utc::now()));
        update.resolved_by = Set(Some(actor.to_string()));
        update.update(self.db.as_ref()).await?;
        info!(alert_id, actor, "alert marked false positive");
        Ok(true)
    }

    /// Counts and distributions over the trailing window. The
    /// false-positive rate is measured against every alert raised in the
    /// window; the distributions exclude false positives.
    pub async fn statistics(&self, days: i64) -> Result<AlertStatistics, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let rows = AlertEntity::find()
            .filter(alert::Column::CreatedAt.gte(cutoff))
            .all(self.db.as_ref())
            .await?;

        let total = rows.len() as u64;
        let false_positives = rows.iter().filter(|r| r.is_false_positive).count() as u64;
        let unread = rows
            .iter()
            .filter(|r| !r.is_read && !r.is_false_positive)
            .count() as u64;

        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for row in rows.iter().filter(|r| !r.is_false_positive) {
            *by_severity.entry(row.severity.clone()).or_default() += 1;
            *by_type.entry(row.alert_type.clone()).or_default() += 1;
        }

        Ok(AlertStatistics {
            period_days: days,
            total,
            unread,
            false_positives,
            false_positive_rate: if total > 0 {
                false_positives as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            by_severity,
            by_type,
        })
    }

    /// Retention: delete read alerts older than the horizon. Unread alerts
    /// are never deleted.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, days: i64) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let result = AlertEntity::delete_many()
            .filter(alert::Column::CreatedAt.lt(cutoff))
            .filter(alert::Column::IsRead.eq(true))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected > 0 {
            info!(deleted = result.rows_affected, days, "old read alerts purged");
        }
        Ok(result.rows_affected)
    }
}
