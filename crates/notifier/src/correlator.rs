//! Provider callback correlation.
//!
//! Callbacks identify an attempt by `(provider, provider_message_id)`.
//! Unknown ids, duplicates and out-of-order events are expected: providers
//! retry webhooks and deliver events in any order. None of these are errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::clock::Clock;
use beacon_common::error::AppError;
use beacon_common::lifecycle::EngagementChange;
use beacon_common::types::{CallbackEventType, DeliveryStatus};
use beacon_engine::store::{AttemptStore, update_attempt};

/// A provider callback as received on the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub provider: String,
    pub provider_message_id: String,
    pub event_type: CallbackEventType,
    #[serde(default)]
    pub event_metadata: serde_json::Value,
    /// When the provider observed the event. Defaults to receipt time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl CallbackEvent {
    fn clicked_url(&self) -> Option<&str> {
        self.event_metadata.get("url").and_then(|v| v.as_str())
    }

    fn reason(&self) -> String {
        ["reason", "error", "description"]
            .iter()
            .find_map(|field| self.event_metadata.get(*field).and_then(|v| v.as_str()))
            .unwrap_or("reported by provider")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Correlation {
    /// The attempt moved forward in the funnel or into a failure state.
    Advanced {
        attempt_id: Uuid,
        status: DeliveryStatus,
    },
    /// A repeat event bumped open/click counters only.
    Counted { attempt_id: Uuid },
    /// Nothing changed.
    Duplicate { attempt_id: Uuid },
    /// The event would move the attempt backwards or out of a terminal state.
    Ignored { attempt_id: Uuid, reason: String },
    Unmatched,
}

pub struct CallbackCorrelator {
    attempts: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl CallbackCorrelator {
    pub fn new(attempts: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self { attempts, clock }
    }

    /// Apply a callback to its attempt.
    ///
    /// Only storage failures are returned as errors.
    pub async fn ingest(&self, event: &CallbackEvent) -> Result<Correlation, AppError> {
        let Some(attempt) = self
            .attempts
            .find_by_provider_message(&event.provider, &event.provider_message_id)
            .await?
        else {
            tracing::info!(
                provider = %event.provider,
                provider_message_id = %event.provider_message_id,
                event_type = %event.event_type,
                "Callback for unknown message dropped"
            );
            return Ok(Correlation::Unmatched);
        };

        let attempt_id = attempt.id;
        let at = event.timestamp.unwrap_or_else(|| self.clock.now());
        let target = event.event_type.target_status();
        let clicked_url = event.clicked_url();
        let reason = event.reason();

        let result = update_attempt(self.attempts.as_ref(), attempt_id, |a| {
            if target.is_failure() {
                let from = a.status;
                let code = format!("PROVIDER_{}", target.to_string().to_uppercase());
                a.mark_failed(target, &code, &reason, at)
                    .map(|_| EngagementChange::Advanced { from, to: target })
            } else {
                a.apply_engagement(target, at, clicked_url)
            }
        })
        .await;

        let correlation = match result {
            Ok((updated, EngagementChange::Advanced { .. })) => Correlation::Advanced {
                attempt_id,
                status: updated.status,
            },
            Ok((_, EngagementChange::Counted)) => Correlation::Counted { attempt_id },
            Ok((_, EngagementChange::Unchanged)) => Correlation::Duplicate { attempt_id },
            Err(AppError::Transition(e)) => Correlation::Ignored {
                attempt_id,
                reason: e.to_string(),
            },
            Err(AppError::NotFound(_)) => Correlation::Unmatched,
            Err(e) => return Err(e),
        };

        tracing::info!(
            %attempt_id,
            provider = %event.provider,
            event_type = %event.event_type,
            result = ?correlation,
            "Provider callback processed"
        );
        Ok(correlation)
    }
}
