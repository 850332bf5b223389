//! Delivery attempt state machine.
//!
//! Every mutation of a [`DeliveryAttempt`] goes through one of the methods
//! here. They validate the edge against [`DeliveryStatus::can_transition_to`],
//! keep the timestamp fields consistent and derive the latency columns.
//! Persisting the result (and bumping `version`) is the store's job.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Channel, DeliveryAttempt, DeliveryStatus};

/// Rejection of a requested state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    Invalid {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("attempt is already terminal ({0})")]
    Terminal(DeliveryStatus),

    #[error("retry budget exhausted ({used}/{max})")]
    RetryBudgetExhausted { used: i32, max: i32 },
}

/// Effect of an engagement event on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementChange {
    /// Status moved forward on the funnel.
    Advanced {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    /// Repeat open or click: counters changed, status did not.
    Counted,
    /// Duplicate event with nothing to record.
    Unchanged,
}

/// Inputs for a fresh pending attempt.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub notification_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel: Channel,
    pub provider: String,
    pub recipient: String,
    pub max_retries: i32,
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

impl DeliveryAttempt {
    /// Create an attempt in `pending`.
    pub fn pending(new: NewAttempt, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id: new.notification_id,
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            channel: new.channel,
            status: DeliveryStatus::Pending,
            provider: new.provider,
            provider_message_id: None,
            provider_response: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries.max(0),
            recipient: new.recipient,
            opened_at: None,
            clicked_at: None,
            open_count: 0,
            click_count: 0,
            last_clicked_url: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            send_latency_ms: None,
            delivery_latency_ms: None,
            version: 0,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_failure()
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Record a successful provider call.
    pub fn mark_sent(
        &mut self,
        provider_message_id: String,
        provider_response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(DeliveryStatus::Sent)?;
        self.status = DeliveryStatus::Sent;
        self.provider_message_id = Some(provider_message_id);
        self.provider_response = Some(provider_response);
        self.error_code = None;
        self.error_message = None;
        self.sent_at = Some(now);
        self.send_latency_ms = Some(millis_between(self.created_at, now));
        self.updated_at = now;
        Ok(())
    }

    /// Consume one retry after a transient failure. The attempt stays `pending`.
    pub fn record_retry(
        &mut self,
        code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.status != DeliveryStatus::Pending {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: DeliveryStatus::Pending,
            });
        }
        if !self.retries_remaining() {
            return Err(TransitionError::RetryBudgetExhausted {
                used: self.retry_count,
                max: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Move to a terminal failure status (`failed`, `bounced` or `rejected`).
    pub fn mark_failed(
        &mut self,
        status: DeliveryStatus,
        code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !status.is_failure() {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: status,
            });
        }
        self.guard(status)?;
        self.status = status;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Apply a delivered / opened / clicked event.
    ///
    /// First occurrences set the timestamp; repeats only bump the counters.
    /// A click without a prior open also records the open, and an open or
    /// click without a prior delivery confirmation records the delivery.
    pub fn apply_engagement(
        &mut self,
        target: DeliveryStatus,
        at: DateTime<Utc>,
        clicked_url: Option<&str>,
    ) -> Result<EngagementChange, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        let target_rank = match target.funnel_rank() {
            Some(rank) if rank >= 2 => rank,
            _ => {
                return Err(TransitionError::Invalid {
                    from: self.status,
                    to: target,
                });
            }
        };
        if !self.status.reached_sent() {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: target,
            });
        }

        let before = (self.delivered_at, self.open_count, self.click_count);

        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
            self.delivery_latency_ms = self.sent_at.map(|sent| millis_between(sent, at));
        }

        match target {
            DeliveryStatus::Opened => {
                self.opened_at.get_or_insert(at);
                self.open_count += 1;
            }
            DeliveryStatus::Clicked => {
                if self.opened_at.is_none() {
                    self.opened_at = Some(at);
                    self.open_count = self.open_count.max(1);
                }
                self.clicked_at.get_or_insert(at);
                self.click_count += 1;
                if let Some(url) = clicked_url {
                    self.last_clicked_url = Some(url.to_string());
                }
            }
            _ => {}
        }

        let from = self.status;
        let current_rank = from.funnel_rank().unwrap_or_default();
        if target_rank > current_rank {
            self.status = target;
            self.updated_at = at;
            return Ok(EngagementChange::Advanced { from, to: target });
        }

        if before == (self.delivered_at, self.open_count, self.click_count) {
            Ok(EngagementChange::Unchanged)
        } else {
            self.updated_at = at;
            Ok(EngagementChange::Counted)
        }
    }

    fn guard(&self, to: DeliveryStatus) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}
