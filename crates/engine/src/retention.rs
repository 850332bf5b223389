//! Hot → cold archival of aged delivery attempts and notification records.
//!
//! Each run moves rows in bounded batches: select aged ids, copy them
//! verbatim into the archive tables, then purge the hot rows whose cold
//! copy is identical. Attempts go first so that records whose attempts
//! were all archived become eligible in the same run. Re-running over the
//! same data moves nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use beacon_common::clock::Clock;
use beacon_common::config::AppConfig;
use beacon_common::error::AppError;

use crate::store::ArchiveStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub attempt_retention: chrono::Duration,
    pub notification_retention: chrono::Duration,
    pub batch_size: i64,
    pub max_batches: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            attempt_retention: chrono::Duration::days(90),
            notification_retention: chrono::Duration::days(180),
            batch_size: 500,
            max_batches: 20,
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempt_retention: chrono::Duration::days(config.attempt_retention_days),
            notification_retention: chrono::Duration::days(config.notification_retention_days),
            batch_size: config.archive_batch_size.max(1),
            max_batches: config.archive_max_batches.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub attempts_archived: u64,
    pub notifications_archived: u64,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Attempts,
    Notifications,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Attempts => "delivery_attempts",
            Table::Notifications => "notifications",
        }
    }
}

pub struct RetentionManager {
    store: Arc<dyn ArchiveStore>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn ArchiveStore>, policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// One archival pass at the clock's current time.
    pub async fn run_once(&self) -> Result<ArchiveSummary, AppError> {
        let now = self.clock.now();
        let attempts_archived = self
            .archive_table(Table::Attempts, now - self.policy.attempt_retention)
            .await?;
        let notifications_archived = self
            .archive_table(Table::Notifications, now - self.policy.notification_retention)
            .await?;

        let summary = ArchiveSummary {
            attempts_archived,
            notifications_archived,
        };
        tracing::info!(
            attempts = summary.attempts_archived,
            notifications = summary.notifications_archived,
            "Archival run complete"
        );
        Ok(summary)
    }

    async fn archive_table(&self, table: Table, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut moved = 0u64;

        for batch in 0..self.policy.max_batches {
            let ids = self.select(table, cutoff).await?;
            if ids.is_empty() {
                break;
            }

            let copied = self.copy(table, &ids).await?;
            let purged = self.purge(table, &ids).await?;
            moved += purged;

            tracing::debug!(
                table = table.name(),
                batch,
                selected = ids.len(),
                copied,
                purged,
                "Archived batch"
            );

            // Rows that changed after copy stay hot; stop instead of reselecting them.
            if purged < ids.len() as u64 {
                if purged == 0 {
                    tracing::warn!(
                        table = table.name(),
                        pending = ids.len(),
                        "Aged rows changed during archival, leaving them for the next run"
                    );
                }
                break;
            }
            if (ids.len() as i64) < self.policy.batch_size {
                break;
            }
        }

        Ok(moved)
    }

    async fn select(&self, table: Table, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        match table {
            Table::Attempts => {
                self.store
                    .aged_attempt_ids(cutoff, self.policy.batch_size)
                    .await
            }
            Table::Notifications => {
                self.store
                    .aged_notification_ids(cutoff, self.policy.batch_size)
                    .await
            }
        }
    }

    async fn copy(&self, table: Table, ids: &[Uuid]) -> Result<u64, AppError> {
        match table {
            Table::Attempts => self.store.copy_attempts_to_cold(ids).await,
            Table::Notifications => self.store.copy_notifications_to_cold(ids).await,
        }
    }

    async fn purge(&self, table: Table, ids: &[Uuid]) -> Result<u64, AppError> {
        match table {
            Table::Attempts => self.store.purge_archived_attempts(ids).await,
            Table::Notifications => self.store.purge_archived_notifications(ids).await,
        }
    }
}

/// Run archival on a fixed interval until `cancel` is triggered.
///
/// A failed run is logged and retried on the next tick.
pub async fn run(manager: Arc<RetentionManager>, every: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = every.as_secs(),
        attempt_retention_days = manager.policy().attempt_retention.num_days(),
        notification_retention_days = manager.policy().notification_retention.num_days(),
        "Archival job started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Archival job stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = manager.run_once().await {
                    tracing::error!(error = %e, "Archival run failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttemptStore, MemoryStore, NotificationStore};
    use beacon_common::clock::ManualClock;
    use beacon_common::lifecycle::NewAttempt;
    use beacon_common::types::{
        Channel, DeliveryAttempt, NotificationMetadata, NotificationRecord, Priority,
    };
    use chrono::TimeZone;
    use sqlx::types::Json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(created_at: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            user_id: Some(Uuid::new_v4()),
            module: "billing".into(),
            event_type: "invoice_overdue".into(),
            entity_type: Some("invoice".into()),
            entity_id: Some("inv-1".into()),
            thread_id: Some("invoice:inv-1".into()),
            title: "Invoice overdue".into(),
            message: "Invoice inv-1 is overdue".into(),
            action_label: None,
            action_url: None,
            priority: Priority::High,
            is_read: false,
            read_at: None,
            is_dismissed: false,
            dismissed_at: None,
            channels: Json(vec![Channel::Email]),
            metadata: Json(NotificationMetadata::default()),
            created_at,
        }
    }

    fn attempt_for(record: &NotificationRecord, created_at: DateTime<Utc>) -> DeliveryAttempt {
        let mut a = DeliveryAttempt::pending(
            NewAttempt {
                notification_id: record.id,
                tenant_id: record.tenant_id,
                user_id: record.user_id,
                channel: Channel::Email,
                provider: "resend".into(),
                recipient: "a@example.com".into(),
                max_retries: 3,
            },
            created_at,
        );
        a.mark_sent(
            "msg-1".into(),
            serde_json::json!({"id": "msg-1"}),
            created_at + chrono::Duration::seconds(1),
        )
        .unwrap();
        a
    }

    fn manager(store: Arc<MemoryStore>, policy: RetentionPolicy) -> RetentionManager {
        RetentionManager::new(store, policy, Arc::new(ManualClock::new(now())))
    }

    #[tokio::test]
    async fn test_aged_attempt_moves_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(91));
        let old = attempt_for(&n, now() - chrono::Duration::days(91));
        let fresh = attempt_for(&n, now() - chrono::Duration::days(10));
        store.insert_notification(&n).await.unwrap();
        store.insert_attempts(&[old.clone(), fresh.clone()]).await.unwrap();

        let summary = manager(store.clone(), RetentionPolicy::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.attempts_archived, 1);
        assert_eq!(summary.notifications_archived, 0);
        assert!(store.hot_attempt(old.id).is_none());
        assert_eq!(store.cold_attempt(old.id), Some(old));
        assert!(store.hot_attempt(fresh.id).is_some());
        assert!(store.hot_notification(n.id).is_some());
    }

    #[tokio::test]
    async fn test_second_run_moves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(200));
        store.insert_notification(&n).await.unwrap();
        store
            .insert_attempts(&[attempt_for(&n, now() - chrono::Duration::days(200))])
            .await
            .unwrap();

        let m = manager(store.clone(), RetentionPolicy::default());
        let first = m.run_once().await.unwrap();
        assert_eq!(
            first,
            ArchiveSummary {
                attempts_archived: 1,
                notifications_archived: 1
            }
        );
        assert_eq!(store.counts(), (0, 0, 1, 1));

        let second = m.run_once().await.unwrap();
        assert_eq!(second, ArchiveSummary::default());
        assert_eq!(store.counts(), (0, 0, 1, 1));
    }

    #[tokio::test]
    async fn test_notification_waits_for_hot_attempts() {
        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(181));
        store.insert_notification(&n).await.unwrap();
        // Attempt created later than its record and still inside its window.
        store
            .insert_attempts(&[attempt_for(&n, now() - chrono::Duration::days(30))])
            .await
            .unwrap();

        let summary = manager(store.clone(), RetentionPolicy::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary, ArchiveSummary::default());
        assert!(store.hot_notification(n.id).is_some());
        assert!(store.cold_notification(n.id).is_none());
    }

    #[tokio::test]
    async fn test_batches_cover_all_aged_rows() {
        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(100));
        store.insert_notification(&n).await.unwrap();
        let rows: Vec<DeliveryAttempt> = (0..7)
            .map(|i| attempt_for(&n, now() - chrono::Duration::days(95 + i)))
            .collect();
        store.insert_attempts(&rows).await.unwrap();

        let policy = RetentionPolicy {
            batch_size: 3,
            ..RetentionPolicy::default()
        };
        let summary = manager(store.clone(), policy).run_once().await.unwrap();
        assert_eq!(summary.attempts_archived, 7);
        assert_eq!(store.counts(), (1, 0, 0, 7));
    }

    #[tokio::test]
    async fn test_max_batches_bounds_a_run() {
        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(100));
        store.insert_notification(&n).await.unwrap();
        let rows: Vec<DeliveryAttempt> = (0..5)
            .map(|i| attempt_for(&n, now() - chrono::Duration::days(95 + i)))
            .collect();
        store.insert_attempts(&rows).await.unwrap();

        let policy = RetentionPolicy {
            batch_size: 2,
            max_batches: 1,
            ..RetentionPolicy::default()
        };
        let m = manager(store.clone(), policy);
        assert_eq!(m.run_once().await.unwrap().attempts_archived, 2);
        assert_eq!(m.run_once().await.unwrap().attempts_archived, 2);
        assert_eq!(m.run_once().await.unwrap().attempts_archived, 1);
    }

    #[tokio::test]
    async fn test_archived_rows_visible_with_all_scope() {
        use crate::store::{StorageScope, TimeRange};

        let store = Arc::new(MemoryStore::new());
        let n = record(now() - chrono::Duration::days(200));
        store.insert_notification(&n).await.unwrap();
        store
            .insert_attempts(&[attempt_for(&n, now() - chrono::Duration::days(200))])
            .await
            .unwrap();
        manager(store.clone(), RetentionPolicy::default())
            .run_once()
            .await
            .unwrap();

        let range = TimeRange::new(now() - chrono::Duration::days(365), now()).unwrap();
        let hot = store
            .attempts_in_range(Uuid::nil(), range, StorageScope::Hot)
            .await
            .unwrap();
        let all = store
            .attempts_in_range(Uuid::nil(), range, StorageScope::All)
            .await
            .unwrap();
        assert!(hot.is_empty());
        assert_eq!(all.len(), 1);
        assert!(store.get_notification(n.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let m = Arc::new(manager(store, RetentionPolicy::default()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(m, Duration::from_secs(3600), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(7200)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
