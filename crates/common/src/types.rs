use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// Delivery medium for a notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::InApp, Channel::Email, Channel::Sms, Channel::Push];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::InApp => write!(f, "in_app"),
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
            Channel::Push => write!(f, "push"),
        }
    }
}

/// Status of a single delivery attempt.
///
/// The success path is the funnel `pending → sent → delivered → opened → clicked`.
/// `failed`, `bounced` and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
    Bounced,
    Rejected,
}

impl DeliveryStatus {
    /// Position on the success funnel. `None` for terminal failures.
    pub fn funnel_rank(self) -> Option<u8> {
        match self {
            DeliveryStatus::Pending => Some(0),
            DeliveryStatus::Sent => Some(1),
            DeliveryStatus::Delivered => Some(2),
            DeliveryStatus::Opened => Some(3),
            DeliveryStatus::Clicked => Some(4),
            DeliveryStatus::Failed | DeliveryStatus::Bounced | DeliveryStatus::Rejected => None,
        }
    }

    pub fn is_failure(self) -> bool {
        self.funnel_rank().is_none()
    }

    /// Whether the attempt has left `pending` and is somewhere on the success funnel.
    pub fn reached_sent(self) -> bool {
        self.funnel_rank().is_some_and(|rank| rank >= 1)
    }

    /// Whether `self → next` is a legal edge of the delivery state machine.
    ///
    /// Funnel moves only go forward. A later engagement stage may arrive
    /// before an earlier one (a click before its open), so forward jumps
    /// past `sent` are legal and the skipped stages are treated as implied.
    /// Failures are reachable only from `pending` or `sent`.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        match (self.funnel_rank(), next.funnel_rank()) {
            (None, _) => false,
            (Some(from), None) => from <= 1,
            (Some(0), Some(to)) => to == 1,
            (Some(from), Some(to)) => to > from,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Opened => write!(f, "opened"),
            DeliveryStatus::Clicked => write!(f, "clicked"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Bounced => write!(f, "bounced"),
            DeliveryStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Notification priority, ordered `low < normal < high < urgent < critical`.
///
/// Older producers emit `medium`; it is the same level as `normal`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[serde(alias = "medium")]
    Normal,
    High,
    Urgent,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "medium" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Provider callback event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackEventType {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Rejected,
}

impl CallbackEventType {
    /// The attempt status this event moves towards.
    pub fn target_status(self) -> DeliveryStatus {
        match self {
            CallbackEventType::Delivered => DeliveryStatus::Delivered,
            CallbackEventType::Opened => DeliveryStatus::Opened,
            CallbackEventType::Clicked => DeliveryStatus::Clicked,
            CallbackEventType::Bounced => DeliveryStatus::Bounced,
            CallbackEventType::Rejected => DeliveryStatus::Rejected,
        }
    }
}

impl std::fmt::Display for CallbackEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.target_status())
    }
}

/// Current version of the [`NotificationMetadata`] layout.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// A single metadata value. Nested objects are not allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

/// Event-specific key/value metadata attached to a notification.
///
/// Version 1: flat map of scalar values or string lists, keyed by
/// snake_case names chosen by the producing module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    pub schema_version: u32,
    #[serde(default)]
    pub fields: BTreeMap<String, MetadataValue>,
}

impl Default for NotificationMetadata {
    fn default() -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            fields: BTreeMap::new(),
        }
    }
}

impl NotificationMetadata {
    /// Build metadata from a free-form JSON object.
    ///
    /// Accepts strings, numbers, booleans and arrays of strings. `null`
    /// entries are skipped.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "metadata must be a JSON object".to_string())?;

        let mut fields = BTreeMap::new();
        for (key, raw) in object {
            let parsed = match raw {
                serde_json::Value::Null => continue,
                serde_json::Value::Bool(b) => MetadataValue::Bool(*b),
                serde_json::Value::Number(n) => MetadataValue::Number(
                    n.as_f64()
                        .ok_or_else(|| format!("metadata field '{key}' is not a finite number"))?,
                ),
                serde_json::Value::String(s) => MetadataValue::Text(s.clone()),
                serde_json::Value::Array(items) => MetadataValue::List(
                    items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_string).ok_or_else(|| {
                                format!("metadata list '{key}' may only contain strings")
                            })
                        })
                        .collect::<Result<_, _>>()?,
                ),
                serde_json::Value::Object(_) => {
                    return Err(format!("metadata field '{key}' must not be a nested object"));
                }
            };
            fields.insert(key.clone(), parsed);
        }

        Ok(Self {
            schema_version: METADATA_SCHEMA_VERSION,
            fields,
        })
    }
}

/// One logical notification surfaced to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// `None` for broadcast notifications.
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
    pub priority: Priority,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_dismissed: bool,
    pub dismissed_at: Option<DateTime<Utc>>,
    /// Requested channels, in request order, without duplicates.
    pub channels: Json<Vec<Channel>>,
    pub metadata: Json<NotificationMetadata>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Whether `user_id` may act on this record. Broadcasts are visible to everyone.
    pub fn addressed_to(&self, user_id: Uuid) -> bool {
        self.user_id.is_none_or(|owner| owner == user_id)
    }
}

/// One channel-specific send for one [`NotificationRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Email, phone number or device token captured at send time.
    pub recipient: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub open_count: i32,
    pub click_count: i32,
    pub last_clicked_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub send_latency_ms: Option<i64>,
    pub delivery_latency_ms: Option<i64>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// An address a user can be reached at on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecipientEndpoint {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub address: String,
    pub active: bool,
}
