use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::entities::alert::Severity;

/// Notification delivery errors. Reported per recipient; a failed recipient
/// never blocks the rest of the fan-out.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outbound notification transport. The actual channel (mail, SMS, chat) is
/// a collaborator outside this subsystem; implementations are fire-and-forget
/// per recipient.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        severity: Severity,
        metadata: &Value,
    ) -> Result<(), NotificationError>;
}

pub type SharedSink = Arc<dyn NotificationSink>;

/// Default sink: structured log lines only. Useful for deployments without a
/// configured transport and as the CLI default.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(
        &self,
        recipient: &str,
        subject: &str,
        _body: &str,
        severity: Severity,
        _metadata: &Value,
    ) -> Result<(), NotificationError> {
        info!(
            notification_id = %Uuid::new_v4(),
            recipient,
            subject,
            severity = severity.as_str(),
            "notification dispatched"
        );
        Ok(())
    }
}
