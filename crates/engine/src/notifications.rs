//! Notification record service: creation, inbox queries, read / dismiss.
//!
//! Records are created once by the triggering event and afterwards only
//! change through read and dismiss actions (and archival relocation).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use beacon_common::clock::Clock;
use beacon_common::error::AppError;
use beacon_common::types::{
    Channel, DeliveryAttempt, DeliveryStatus, NotificationMetadata, NotificationRecord, Priority,
};

use crate::store::{AttemptStore, InboxQuery, NotificationStore, update_attempt};

const MAX_TITLE_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 4000;
const MAX_BATCH_IDS: usize = 500;

/// Parameters for creating a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationParams {
    pub tenant_id: Uuid,
    /// `None` broadcasts to every user of the tenant.
    pub user_id: Option<Uuid>,
    pub module: String,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub thread_id: Option<String>,
    pub title: String,
    pub message: String,
    pub action_label: Option<String>,
    pub action_url: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub channels: Vec<Channel>,
    pub metadata: Option<serde_json::Value>,
}

/// Per-channel view of a delivery attempt for the notification owner.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptStatusView {
    pub attempt_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub recipient: String,
    pub retry_count: i32,
    /// Human-readable failure reason, present for failed attempts.
    pub reason: Option<String>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&DeliveryAttempt> for AttemptStatusView {
    fn from(a: &DeliveryAttempt) -> Self {
        Self {
            attempt_id: a.id,
            channel: a.channel,
            status: a.status,
            recipient: a.recipient.clone(),
            retry_count: a.retry_count,
            reason: a.is_terminal().then(|| failure_reason(a)),
            sent_at: a.sent_at,
            delivered_at: a.delivered_at,
        }
    }
}

/// A notification together with the current status of each channel attempt.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationDetail {
    pub notification: NotificationRecord,
    pub attempts: Vec<AttemptStatusView>,
}

fn failure_reason(a: &DeliveryAttempt) -> String {
    let summary = match a.error_code.as_deref() {
        Some("CIRCUIT_OPEN") => "Provider temporarily unavailable; delivery was not attempted",
        Some("TIMEOUT") => "Delivery did not complete before the deadline",
        Some("CONFIGURATION_ERROR") => "Delivery channel is not configured",
        Some("PERMANENT_RECIPIENT_ERROR") => "Recipient address is invalid or no longer registered",
        Some("TRANSIENT_PROVIDER_ERROR") => "Provider kept failing after all retries",
        Some("NO_RECIPIENT") => "No active address on file for this channel",
        Some("VALIDATION_ERROR") => "Provider rejected the message",
        _ => match a.status {
            DeliveryStatus::Bounced => "Message bounced",
            DeliveryStatus::Rejected => "Message rejected by the provider",
            _ => "Delivery failed",
        },
    };

    match a.error_message.as_deref() {
        Some(detail) if !detail.is_empty() => format!("{summary} ({detail})"),
        _ => summary.to_string(),
    }
}

/// Service layer for notification records.
pub struct NotificationService {
    notifications: Arc<dyn NotificationStore>,
    attempts: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        attempts: Arc<dyn AttemptStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            attempts,
            clock,
        }
    }

    /// Validate parameters and build the record to insert. Nothing is persisted.
    pub fn build_record(
        params: &CreateNotificationParams,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<NotificationRecord, AppError> {
        if params.tenant_id.is_nil() {
            return Err(AppError::Validation("tenant_id is required".to_string()));
        }
        let module = required("module", &params.module)?;
        let event_type = required("event_type", &params.event_type)?;
        let title = required("title", &params.title)?;
        let message = required("message", &params.message)?;
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(AppError::Validation(format!(
                "title must be at most {MAX_TITLE_LEN} characters"
            )));
        }
        if message.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::Validation(format!(
                "message must be at most {MAX_MESSAGE_LEN} characters"
            )));
        }

        let mut channels: Vec<Channel> = Vec::with_capacity(params.channels.len());
        for channel in &params.channels {
            if !channels.contains(channel) {
                channels.push(*channel);
            }
        }
        if channels.is_empty() {
            return Err(AppError::Validation(
                "at least one target channel is required".to_string(),
            ));
        }

        let action_url = params
            .action_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        if let Some(url) = action_url
            && !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with('/'))
        {
            return Err(AppError::Validation(format!(
                "action_url '{url}' must be an absolute http(s) URL or an app path"
            )));
        }
        if params.action_label.is_some() && action_url.is_none() {
            return Err(AppError::Validation(
                "action_label requires action_url".to_string(),
            ));
        }

        let metadata = match &params.metadata {
            Some(value) => {
                NotificationMetadata::from_json(value).map_err(AppError::Validation)?
            }
            None => NotificationMetadata::default(),
        };

        let entity_type = optional(&params.entity_type);
        let entity_id = optional(&params.entity_id);
        let thread_id = optional(&params.thread_id).or_else(|| match (&entity_type, &entity_id) {
            (Some(kind), Some(id)) => Some(format!("{kind}:{id}")),
            _ => None,
        });

        Ok(NotificationRecord {
            id: Uuid::new_v4(),
            tenant_id: params.tenant_id,
            user_id: params.user_id,
            module,
            event_type,
            entity_type,
            entity_id,
            thread_id,
            title,
            message,
            action_label: optional(&params.action_label),
            action_url: action_url.map(str::to_string),
            priority: params.priority,
            is_read: false,
            read_at: None,
            is_dismissed: false,
            dismissed_at: None,
            channels: Json(channels),
            metadata: Json(metadata),
            created_at: now,
        })
    }

    /// Validate and persist a new notification record.
    pub async fn create(
        &self,
        params: &CreateNotificationParams,
    ) -> Result<NotificationRecord, AppError> {
        let record = Self::build_record(params, self.clock.now())?;
        self.notifications.insert_notification(&record).await?;

        tracing::info!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            module = %record.module,
            event_type = %record.event_type,
            priority = %record.priority,
            "Notification created"
        );

        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<NotificationRecord, AppError> {
        self.notifications
            .get_notification(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {id} not found")))
    }

    /// A notification plus the per-channel status of its attempts.
    pub async fn detail(&self, id: Uuid) -> Result<NotificationDetail, AppError> {
        let notification = self.get(id).await?;
        let attempts = self.attempts.attempts_for_notification(id).await?;
        Ok(NotificationDetail {
            notification,
            attempts: attempts.iter().map(AttemptStatusView::from).collect(),
        })
    }

    /// Mark notifications read. In-app attempts of the affected records count as opened.
    pub async fn mark_read(&self, user_id: Uuid, ids: &[Uuid]) -> Result<u64, AppError> {
        check_batch(ids)?;
        let now = self.clock.now();
        let changed = self.notifications.mark_read(ids, user_id, now).await?;

        for notification_id in &changed {
            let attempts = self.attempts.attempts_for_notification(*notification_id).await?;
            for attempt in attempts
                .iter()
                .filter(|a| a.channel == Channel::InApp && a.status.reached_sent())
            {
                let result = update_attempt(self.attempts.as_ref(), attempt.id, |a| {
                    a.apply_engagement(DeliveryStatus::Opened, now, None)
                })
                .await;
                if let Err(e) = result {
                    tracing::warn!(
                        attempt_id = %attempt.id,
                        error = %e,
                        "Could not record in-app open"
                    );
                }
            }
        }

        tracing::info!(user_id = %user_id, affected = changed.len(), "Notifications marked read");
        Ok(changed.len() as u64)
    }

    pub async fn dismiss(&self, user_id: Uuid, ids: &[Uuid]) -> Result<u64, AppError> {
        check_batch(ids)?;
        let changed = self
            .notifications
            .dismiss(ids, user_id, self.clock.now())
            .await?;

        tracing::info!(user_id = %user_id, affected = changed.len(), "Notifications dismissed");
        Ok(changed.len() as u64)
    }

    pub async fn inbox(&self, query: &InboxQuery) -> Result<Vec<NotificationRecord>, AppError> {
        if !(1..=200).contains(&query.limit) {
            return Err(AppError::Validation(
                "limit must be between 1 and 200".to_string(),
            ));
        }
        self.notifications.list_for_user(query).await
    }

    pub async fn unread_count(&self, tenant_id: Uuid, user_id: Uuid) -> Result<i64, AppError> {
        self.notifications.count_unread(tenant_id, user_id).await
    }

    pub async fn thread(
        &self,
        tenant_id: Uuid,
        thread_id: &str,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.notifications.list_thread(tenant_id, thread_id).await
    }
}

fn required(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn check_batch(ids: &[Uuid]) -> Result<(), AppError> {
    if ids.is_empty() {
        return Err(AppError::Validation("ids must not be empty".to_string()));
    }
    if ids.len() > MAX_BATCH_IDS {
        return Err(AppError::Validation(format!(
            "at most {MAX_BATCH_IDS} ids per request"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn params() -> CreateNotificationParams {
        CreateNotificationParams {
            tenant_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            module: "sales_orders".to_string(),
            event_type: "order_status_changed".to_string(),
            entity_type: Some("vehicle".to_string()),
            entity_id: Some("1HGCM82633A004352".to_string()),
            thread_id: None,
            title: "Order ready".to_string(),
            message: "Vehicle is ready for delivery".to_string(),
            action_label: Some("Open order".to_string()),
            action_url: Some("/orders/42".to_string()),
            priority: Priority::High,
            channels: vec![Channel::InApp, Channel::Email, Channel::InApp],
            metadata: Some(serde_json::json!({"order_number": "SO-42", "stock": 3})),
        }
    }

    #[test]
    fn test_build_record_defaults_thread_and_dedupes_channels() {
        let record = NotificationService::build_record(&params(), Utc::now()).unwrap();
        assert_eq!(record.thread_id.as_deref(), Some("vehicle:1HGCM82633A004352"));
        assert_eq!(record.channels.0, vec![Channel::InApp, Channel::Email]);
        assert!(!record.is_read && record.read_at.is_none());
        assert_eq!(record.metadata.0.fields.len(), 2);
    }

    #[test]
    fn test_build_record_rejects_missing_channels() {
        let mut p = params();
        p.channels.clear();
        assert!(matches!(
            NotificationService::build_record(&p, Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_build_record_rejects_bad_action_url() {
        let mut p = params();
        p.action_url = Some("javascript:alert(1)".to_string());
        assert!(matches!(
            NotificationService::build_record(&p, Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_build_record_rejects_nested_metadata() {
        let mut p = params();
        p.metadata = Some(serde_json::json!({"vehicle": {"vin": "x"}}));
        assert!(matches!(
            NotificationService::build_record(&p, Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_medium_priority_is_normal() {
        let p: Priority = serde_json::from_value(serde_json::json!("medium")).unwrap();
        assert_eq!(p, Priority::Normal);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Normal);
    }
}
