//! PostgreSQL-backed stores.
//!
//! Hot rows live in `notifications` / `delivery_attempts`; cold rows in the
//! structurally identical `*_archive` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{DeliveryAttempt, NotificationRecord};

use super::{
    ArchiveStore, AttemptStore, InboxQuery, NotificationStore, StorageScope, TimeRange,
};

/// Stores backed by a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notification(&self, record: &NotificationRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, tenant_id, user_id, module, event_type, entity_type, entity_id, thread_id,
                title, message, action_label, action_url, priority, is_read, read_at,
                is_dismissed, dismissed_at, channels, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.user_id)
        .bind(&record.module)
        .bind(&record.event_type)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.thread_id)
        .bind(&record.title)
        .bind(&record.message)
        .bind(&record.action_label)
        .bind(&record.action_url)
        .bind(record.priority)
        .bind(record.is_read)
        .bind(record.read_at)
        .bind(record.is_dismissed)
        .bind(record.dismissed_at)
        .bind(&record.channels)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        let record: Option<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT * FROM notifications WHERE id = $1
            UNION ALL
            SELECT * FROM notifications_archive WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_read(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let changed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET is_read = TRUE, read_at = $3
            WHERE id = ANY($1) AND user_id = $2 AND is_read = FALSE
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(user_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(changed.into_iter().map(|(id,)| id).collect())
    }

    async fn dismiss(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let changed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET is_dismissed = TRUE, dismissed_at = $3
            WHERE id = ANY($1) AND user_id = $2 AND is_dismissed = FALSE
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(user_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(changed.into_iter().map(|(id,)| id).collect())
    }

    async fn list_for_user(
        &self,
        query: &InboxQuery,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let rows: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE tenant_id = $1
              AND (user_id = $2 OR user_id IS NULL)
              AND is_dismissed = FALSE
              AND ($3 = FALSE OR is_read = FALSE)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(query.tenant_id)
        .bind(query.user_id)
        .bind(query.unread_only)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_unread(&self, tenant_id: Uuid, user_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE tenant_id = $1 AND user_id = $2 AND is_read = FALSE AND is_dismissed = FALSE
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_thread(
        &self,
        tenant_id: Uuid,
        thread_id: &str,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let rows: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT * FROM (
                SELECT * FROM notifications WHERE tenant_id = $1 AND thread_id = $2
                UNION ALL
                SELECT * FROM notifications_archive WHERE tenant_id = $1 AND thread_id = $2
            ) t
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn notifications_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let rows: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            UNION ALL
            SELECT * FROM notifications_archive
            WHERE $4 AND tenant_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(tenant_id)
        .bind(range.start)
        .bind(range.end)
        .bind(scope == StorageScope::All)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn insert_attempts(&self, attempts: &[DeliveryAttempt]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        for a in attempts {
            sqlx::query(
                r#"
                INSERT INTO delivery_attempts (
                    id, notification_id, tenant_id, user_id, channel, status, provider,
                    provider_message_id, provider_response, error_code, error_message,
                    retry_count, max_retries, recipient, opened_at, clicked_at, open_count,
                    click_count, last_clicked_url, created_at, sent_at, delivered_at, failed_at,
                    send_latency_ms, delivery_latency_ms, version, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                        $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
                "#,
            )
            .bind(a.id)
            .bind(a.notification_id)
            .bind(a.tenant_id)
            .bind(a.user_id)
            .bind(a.channel)
            .bind(a.status)
            .bind(&a.provider)
            .bind(&a.provider_message_id)
            .bind(&a.provider_response)
            .bind(&a.error_code)
            .bind(&a.error_message)
            .bind(a.retry_count)
            .bind(a.max_retries)
            .bind(&a.recipient)
            .bind(a.opened_at)
            .bind(a.clicked_at)
            .bind(a.open_count)
            .bind(a.click_count)
            .bind(&a.last_clicked_url)
            .bind(a.created_at)
            .bind(a.sent_at)
            .bind(a.delivered_at)
            .bind(a.failed_at)
            .bind(a.send_latency_ms)
            .bind(a.delivery_latency_ms)
            .bind(a.version)
            .bind(a.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<DeliveryAttempt>, AppError> {
        let attempt: Option<DeliveryAttempt> =
            sqlx::query_as("SELECT * FROM delivery_attempts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(attempt)
    }

    async fn find_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        let attempt: Option<DeliveryAttempt> = sqlx::query_as(
            "SELECT * FROM delivery_attempts WHERE provider = $1 AND provider_message_id = $2",
        )
        .bind(provider)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempt)
    }

    async fn compare_and_swap(&self, a: &DeliveryAttempt) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts SET
                status = $3,
                provider_message_id = $4,
                provider_response = $5,
                error_code = $6,
                error_message = $7,
                retry_count = $8,
                opened_at = $9,
                clicked_at = $10,
                open_count = $11,
                click_count = $12,
                last_clicked_url = $13,
                sent_at = $14,
                delivered_at = $15,
                failed_at = $16,
                send_latency_ms = $17,
                delivery_latency_ms = $18,
                updated_at = $19,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(a.id)
        .bind(a.version)
        .bind(a.status)
        .bind(&a.provider_message_id)
        .bind(&a.provider_response)
        .bind(&a.error_code)
        .bind(&a.error_message)
        .bind(a.retry_count)
        .bind(a.opened_at)
        .bind(a.clicked_at)
        .bind(a.open_count)
        .bind(a.click_count)
        .bind(&a.last_clicked_url)
        .bind(a.sent_at)
        .bind(a.delivered_at)
        .bind(a.failed_at)
        .bind(a.send_latency_ms)
        .bind(a.delivery_latency_ms)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn attempts_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows: Vec<DeliveryAttempt> = sqlx::query_as(
            r#"
            SELECT * FROM (
                SELECT * FROM delivery_attempts WHERE notification_id = $1
                UNION ALL
                SELECT * FROM delivery_attempts_archive WHERE notification_id = $1
            ) a
            ORDER BY created_at ASC, channel ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn attempts_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows: Vec<DeliveryAttempt> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            UNION ALL
            SELECT * FROM delivery_attempts_archive
            WHERE $4 AND tenant_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(tenant_id)
        .bind(range.start)
        .bind(range.end)
        .bind(scope == StorageScope::All)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl ArchiveStore for PgStore {
    async fn aged_attempt_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM delivery_attempts
            WHERE created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn copy_attempts_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        // Drop stale copies left by an earlier run whose hot row changed since.
        sqlx::query(
            r#"
            DELETE FROM delivery_attempts_archive c
            USING delivery_attempts h
            WHERE c.id = h.id AND c.id = ANY($1) AND ROW(c.*) IS DISTINCT FROM ROW(h.*)
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        let copied = sqlx::query(
            r#"
            INSERT INTO delivery_attempts_archive
            SELECT * FROM delivery_attempts WHERE id = ANY($1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(copied)
    }

    async fn purge_archived_attempts(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let purged = sqlx::query(
            r#"
            DELETE FROM delivery_attempts h
            USING delivery_attempts_archive c
            WHERE h.id = c.id AND h.id = ANY($1) AND ROW(h.*) IS NOT DISTINCT FROM ROW(c.*)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(purged)
    }

    async fn aged_notification_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT n.id FROM notifications n
            WHERE n.created_at < $1
              AND NOT EXISTS (SELECT 1 FROM delivery_attempts a WHERE a.notification_id = n.id)
            ORDER BY n.created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn copy_notifications_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM notifications_archive c
            USING notifications h
            WHERE c.id = h.id AND c.id = ANY($1) AND ROW(c.*) IS DISTINCT FROM ROW(h.*)
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        let copied = sqlx::query(
            r#"
            INSERT INTO notifications_archive
            SELECT * FROM notifications WHERE id = ANY($1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(copied)
    }

    async fn purge_archived_notifications(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let purged = sqlx::query(
            r#"
            DELETE FROM notifications h
            USING notifications_archive c
            WHERE h.id = c.id
              AND h.id = ANY($1)
              AND ROW(h.*) IS NOT DISTINCT FROM ROW(c.*)
              AND NOT EXISTS (SELECT 1 FROM delivery_attempts a WHERE a.notification_id = h.id)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(purged)
    }
}
