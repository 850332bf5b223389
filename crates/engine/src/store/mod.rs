//! Persistence seams for notification records and delivery attempts.
//!
//! Two implementations ship with the crate: [`PgStore`] over PostgreSQL and
//! [`MemoryStore`] for tests and single-process tooling. Both keep a hot
//! tier (live rows) and a cold tier (archived rows with identical shape).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::lifecycle::TransitionError;
use beacon_common::types::{DeliveryAttempt, NotificationRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Attempts to re-read and re-apply a mutation after losing an optimistic race.
const MAX_CAS_RETRIES: usize = 16;

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if end <= start {
            return Err(AppError::Validation(format!(
                "time range end ({end}) must be after start ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Which storage tiers a read covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    #[default]
    Hot,
    /// Hot and cold rows combined.
    All,
}

/// Inbox listing filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxQuery {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_inbox_limit")]
    pub limit: i64,
}

fn default_inbox_limit() -> i64 {
    50
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, record: &NotificationRecord) -> Result<(), AppError>;

    /// Look up a record in hot storage, falling back to cold.
    async fn get_notification(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError>;

    /// Mark unread records owned by `user_id` as read. Returns the ids that changed.
    async fn mark_read(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError>;

    /// Dismiss records owned by `user_id`. Returns the ids that changed.
    async fn dismiss(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError>;

    /// Newest-first, non-dismissed records for a user (including broadcasts).
    async fn list_for_user(&self, query: &InboxQuery)
    -> Result<Vec<NotificationRecord>, AppError>;

    async fn count_unread(&self, tenant_id: Uuid, user_id: Uuid) -> Result<i64, AppError>;

    /// Oldest-first records of one thread.
    async fn list_thread(
        &self,
        tenant_id: Uuid,
        thread_id: &str,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    async fn notifications_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<NotificationRecord>, AppError>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Insert new attempts. Their parent notification must be in hot storage.
    async fn insert_attempts(&self, attempts: &[DeliveryAttempt]) -> Result<(), AppError>;

    /// Fetch a hot attempt. Archived attempts are read-only and not returned.
    async fn get_attempt(&self, id: Uuid) -> Result<Option<DeliveryAttempt>, AppError>;

    async fn find_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError>;

    /// Persist `attempt` only if the stored row still has `attempt.version`.
    /// On success the stored version becomes `attempt.version + 1`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(&self, attempt: &DeliveryAttempt) -> Result<bool, AppError>;

    /// All attempts of a notification across both tiers.
    async fn attempts_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;

    /// Attempts created inside `range` for a tenant.
    async fn attempts_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;
}

/// Hot → cold relocation primitives used by the retention manager.
///
/// Copies are verbatim and insert-if-absent. Purges delete a hot row only
/// when an identical cold copy exists, so a row that changed after being
/// copied stays hot until the next run.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn aged_attempt_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError>;

    async fn copy_attempts_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError>;

    async fn purge_archived_attempts(&self, ids: &[Uuid]) -> Result<u64, AppError>;

    /// Aged records with no attempts left in hot storage.
    async fn aged_notification_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError>;

    async fn copy_notifications_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError>;

    async fn purge_archived_notifications(&self, ids: &[Uuid]) -> Result<u64, AppError>;
}

/// Apply `mutate` to a hot attempt under optimistic concurrency control.
///
/// The row is re-read and the mutation re-applied whenever the version moved
/// underneath us. A mutation that leaves the row unchanged is not written.
/// State machine rejections surface as [`AppError::Transition`].
pub async fn update_attempt<T, F>(
    store: &dyn AttemptStore,
    id: Uuid,
    mut mutate: F,
) -> Result<(DeliveryAttempt, T), AppError>
where
    F: FnMut(&mut DeliveryAttempt) -> Result<T, TransitionError> + Send,
    T: Send,
{
    for _ in 0..MAX_CAS_RETRIES {
        let current = store
            .get_attempt(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Delivery attempt {id} not found")))?;

        let mut next = current.clone();
        let value = mutate(&mut next)?;
        if next == current {
            return Ok((current, value));
        }

        if store.compare_and_swap(&next).await? {
            next.version += 1;
            return Ok((next, value));
        }

        tracing::debug!(attempt_id = %id, "Lost optimistic update race, re-reading attempt");
    }

    Err(AppError::Conflict(format!(
        "Delivery attempt {id} kept changing during update"
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use beacon_common::lifecycle::NewAttempt;
    use beacon_common::types::{Channel, DeliveryStatus};

    use super::*;
    use crate::notifications::{CreateNotificationParams, NotificationService};

    /// Lets another writer bump the row between our read and our write.
    struct InterleavedWriter {
        inner: MemoryStore,
        interleave: AtomicUsize,
    }

    #[async_trait]
    impl AttemptStore for InterleavedWriter {
        async fn insert_attempts(&self, attempts: &[DeliveryAttempt]) -> Result<(), AppError> {
            self.inner.insert_attempts(attempts).await
        }

        async fn get_attempt(&self, id: Uuid) -> Result<Option<DeliveryAttempt>, AppError> {
            self.inner.get_attempt(id).await
        }

        async fn find_by_provider_message(
            &self,
            provider: &str,
            provider_message_id: &str,
        ) -> Result<Option<DeliveryAttempt>, AppError> {
            self.inner
                .find_by_provider_message(provider, provider_message_id)
                .await
        }

        async fn compare_and_swap(&self, attempt: &DeliveryAttempt) -> Result<bool, AppError> {
            let pending = self.interleave.load(Ordering::SeqCst);
            if pending > 0 {
                self.interleave.store(pending - 1, Ordering::SeqCst);
                if let Some(mut current) = self.inner.get_attempt(attempt.id).await? {
                    current.record_retry("TRANSIENT_PROVIDER_ERROR", "busy", Utc::now())?;
                    current.max_retries += 1;
                    assert!(self.inner.compare_and_swap(&current).await?);
                }
            }
            self.inner.compare_and_swap(attempt).await
        }

        async fn attempts_for_notification(
            &self,
            notification_id: Uuid,
        ) -> Result<Vec<DeliveryAttempt>, AppError> {
            self.inner.attempts_for_notification(notification_id).await
        }

        async fn attempts_in_range(
            &self,
            tenant_id: Uuid,
            range: TimeRange,
            scope: StorageScope,
        ) -> Result<Vec<DeliveryAttempt>, AppError> {
            self.inner.attempts_in_range(tenant_id, range, scope).await
        }
    }

    async fn seeded(interleave: usize) -> (InterleavedWriter, Uuid) {
        let params = CreateNotificationParams {
            tenant_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            module: "parts".to_string(),
            event_type: "backorder_arrived".to_string(),
            entity_type: None,
            entity_id: None,
            thread_id: None,
            title: "Part arrived".to_string(),
            message: "Backordered part is in stock".to_string(),
            action_label: None,
            action_url: None,
            priority: Default::default(),
            channels: vec![Channel::Email],
            metadata: None,
        };
        let now = Utc::now();
        let record = NotificationService::build_record(&params, now).unwrap();
        let inner = MemoryStore::new();
        inner.insert_notification(&record).await.unwrap();

        let attempt = DeliveryAttempt::pending(
            NewAttempt {
                notification_id: record.id,
                tenant_id: record.tenant_id,
                user_id: record.user_id,
                channel: Channel::Email,
                provider: "resend".to_string(),
                recipient: "parts@example.com".to_string(),
                max_retries: 1,
            },
            now,
        );
        inner.insert_attempts(std::slice::from_ref(&attempt)).await.unwrap();

        let store = InterleavedWriter {
            inner,
            interleave: AtomicUsize::new(interleave),
        };
        (store, attempt.id)
    }

    #[tokio::test]
    async fn test_update_attempt_reapplies_after_lost_race() {
        let (store, id) = seeded(1).await;
        let calls = AtomicUsize::new(0);

        let (updated, ()) = update_attempt(&store, id, |a| {
            calls.fetch_add(1, Ordering::SeqCst);
            a.mark_sent("msg-7".to_string(), serde_json::json!({}), Utc::now())
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Both writers' changes survive.
        assert_eq!(updated.status, DeliveryStatus::Sent);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.version, 2);
        assert_eq!(store.get_attempt(id).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_update_attempt_gives_up_with_conflict() {
        let (store, id) = seeded(usize::MAX).await;
        let calls = AtomicUsize::new(0);

        let result = update_attempt(&store, id, |a| {
            calls.fetch_add(1, Ordering::SeqCst);
            a.mark_sent("msg-8".to_string(), serde_json::json!({}), Utc::now())
        })
        .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CAS_RETRIES);
    }

    #[tokio::test]
    async fn test_update_attempt_skips_write_when_unchanged() {
        let (store, id) = seeded(1).await;

        let (unchanged, ()) = update_attempt(&store, id, |_| Ok(())).await.unwrap();

        assert_eq!(unchanged.version, 0);
        // No write, so the interleaving writer never ran.
        assert_eq!(store.interleave.load(Ordering::SeqCst), 1);
    }
}
