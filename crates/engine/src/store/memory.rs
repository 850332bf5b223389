//! In-process store with the same semantics as the PostgreSQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{DeliveryAttempt, NotificationRecord};

use super::{
    ArchiveStore, AttemptStore, InboxQuery, NotificationStore, StorageScope, TimeRange,
};

#[derive(Debug, Default)]
struct Tables {
    notifications: HashMap<Uuid, NotificationRecord>,
    attempts: HashMap<Uuid, DeliveryAttempt>,
    cold_notifications: HashMap<Uuid, NotificationRecord>,
    cold_attempts: HashMap<Uuid, DeliveryAttempt>,
}

/// Hot and cold tables held in memory behind a single lock.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hot_attempt(&self, id: Uuid) -> Option<DeliveryAttempt> {
        self.tables.read().attempts.get(&id).cloned()
    }

    pub fn cold_attempt(&self, id: Uuid) -> Option<DeliveryAttempt> {
        self.tables.read().cold_attempts.get(&id).cloned()
    }

    pub fn hot_notification(&self, id: Uuid) -> Option<NotificationRecord> {
        self.tables.read().notifications.get(&id).cloned()
    }

    pub fn cold_notification(&self, id: Uuid) -> Option<NotificationRecord> {
        self.tables.read().cold_notifications.get(&id).cloned()
    }

    /// Row counts as `(hot notifications, hot attempts, cold notifications, cold attempts)`.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let t = self.tables.read();
        (
            t.notifications.len(),
            t.attempts.len(),
            t.cold_notifications.len(),
            t.cold_attempts.len(),
        )
    }
}

fn in_scope<'a, T>(
    hot: &'a HashMap<Uuid, T>,
    cold: &'a HashMap<Uuid, T>,
    scope: StorageScope,
) -> Box<dyn Iterator<Item = &'a T> + 'a> {
    match scope {
        StorageScope::Hot => Box::new(hot.values()),
        StorageScope::All => Box::new(hot.values().chain(cold.values())),
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notification(&self, record: &NotificationRecord) -> Result<(), AppError> {
        let mut t = self.tables.write();
        if t.notifications.contains_key(&record.id) {
            return Err(AppError::Conflict(format!(
                "Notification {} already exists",
                record.id
            )));
        }
        t.notifications.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        let t = self.tables.read();
        Ok(t
            .notifications
            .get(&id)
            .or_else(|| t.cold_notifications.get(&id))
            .cloned())
    }

    async fn mark_read(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut t = self.tables.write();
        let mut changed = Vec::new();
        for id in ids {
            if let Some(record) = t.notifications.get_mut(id)
                && record.user_id == Some(user_id)
                && !record.is_read
            {
                record.is_read = true;
                record.read_at = Some(at);
                changed.push(*id);
            }
        }
        Ok(changed)
    }

    async fn dismiss(
        &self,
        ids: &[Uuid],
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut t = self.tables.write();
        let mut changed = Vec::new();
        for id in ids {
            if let Some(record) = t.notifications.get_mut(id)
                && record.user_id == Some(user_id)
                && !record.is_dismissed
            {
                record.is_dismissed = true;
                record.dismissed_at = Some(at);
                changed.push(*id);
            }
        }
        Ok(changed)
    }

    async fn list_for_user(
        &self,
        query: &InboxQuery,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let t = self.tables.read();
        let mut rows: Vec<NotificationRecord> = t
            .notifications
            .values()
            .filter(|r| r.tenant_id == query.tenant_id && r.addressed_to(query.user_id))
            .filter(|r| !r.is_dismissed && !(query.unread_only && r.is_read))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(query.limit.max(0) as usize);
        Ok(rows)
    }

    async fn count_unread(&self, tenant_id: Uuid, user_id: Uuid) -> Result<i64, AppError> {
        let t = self.tables.read();
        Ok(t.notifications
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.user_id == Some(user_id))
            .filter(|r| !r.is_read && !r.is_dismissed)
            .count() as i64)
    }

    async fn list_thread(
        &self,
        tenant_id: Uuid,
        thread_id: &str,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let t = self.tables.read();
        let mut rows: Vec<NotificationRecord> = in_scope(
            &t.notifications,
            &t.cold_notifications,
            StorageScope::All,
        )
        .filter(|r| r.tenant_id == tenant_id && r.thread_id.as_deref() == Some(thread_id))
        .cloned()
        .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn notifications_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let t = self.tables.read();
        Ok(in_scope(&t.notifications, &t.cold_notifications, scope)
            .filter(|r| r.tenant_id == tenant_id && range.contains(r.created_at))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn insert_attempts(&self, attempts: &[DeliveryAttempt]) -> Result<(), AppError> {
        let mut t = self.tables.write();
        for attempt in attempts {
            if !t.notifications.contains_key(&attempt.notification_id) {
                return Err(AppError::NotFound(format!(
                    "Notification {} not found in hot storage",
                    attempt.notification_id
                )));
            }
            if t.attempts.contains_key(&attempt.id) {
                return Err(AppError::Conflict(format!(
                    "Delivery attempt {} already exists",
                    attempt.id
                )));
            }
        }
        for attempt in attempts {
            t.attempts.insert(attempt.id, attempt.clone());
        }
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<DeliveryAttempt>, AppError> {
        Ok(self.tables.read().attempts.get(&id).cloned())
    }

    async fn find_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        Ok(self
            .tables
            .read()
            .attempts
            .values()
            .find(|a| {
                a.provider == provider
                    && a.provider_message_id.as_deref() == Some(provider_message_id)
            })
            .cloned())
    }

    async fn compare_and_swap(&self, attempt: &DeliveryAttempt) -> Result<bool, AppError> {
        let mut t = self.tables.write();
        match t.attempts.get_mut(&attempt.id) {
            Some(stored) if stored.version == attempt.version => {
                *stored = attempt.clone();
                stored.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!(
                "Delivery attempt {} not found",
                attempt.id
            ))),
        }
    }

    async fn attempts_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let t = self.tables.read();
        let mut rows: Vec<DeliveryAttempt> =
            in_scope(&t.attempts, &t.cold_attempts, StorageScope::All)
                .filter(|a| a.notification_id == notification_id)
                .cloned()
                .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.channel.cmp(&b.channel)));
        Ok(rows)
    }

    async fn attempts_in_range(
        &self,
        tenant_id: Uuid,
        range: TimeRange,
        scope: StorageScope,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let t = self.tables.read();
        Ok(in_scope(&t.attempts, &t.cold_attempts, scope)
            .filter(|a| a.tenant_id == tenant_id && range.contains(a.created_at))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn aged_attempt_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let t = self.tables.read();
        let mut aged: Vec<&DeliveryAttempt> =
            t.attempts.values().filter(|a| a.created_at < cutoff).collect();
        aged.sort_by_key(|a| a.created_at);
        Ok(aged
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|a| a.id)
            .collect())
    }

    async fn copy_attempts_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut t = self.tables.write();
        let mut copied = 0;
        for id in ids {
            let Some(row) = t.attempts.get(id).cloned() else {
                continue;
            };
            if t.cold_attempts.get(id) != Some(&row) {
                t.cold_attempts.insert(*id, row);
                copied += 1;
            }
        }
        Ok(copied)
    }

    async fn purge_archived_attempts(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut t = self.tables.write();
        let mut purged = 0;
        for id in ids {
            let identical = matches!(
                (t.attempts.get(id), t.cold_attempts.get(id)),
                (Some(hot), Some(cold)) if hot == cold
            );
            if identical {
                t.attempts.remove(id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn aged_notification_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let t = self.tables.read();
        let mut aged: Vec<&NotificationRecord> = t
            .notifications
            .values()
            .filter(|n| n.created_at < cutoff)
            .filter(|n| !t.attempts.values().any(|a| a.notification_id == n.id))
            .collect();
        aged.sort_by_key(|n| n.created_at);
        Ok(aged
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| n.id)
            .collect())
    }

    async fn copy_notifications_to_cold(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut t = self.tables.write();
        let mut copied = 0;
        for id in ids {
            let Some(row) = t.notifications.get(id).cloned() else {
                continue;
            };
            if t.cold_notifications.get(id) != Some(&row) {
                t.cold_notifications.insert(*id, row);
                copied += 1;
            }
        }
        Ok(copied)
    }

    async fn purge_archived_notifications(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut t = self.tables.write();
        let mut purged = 0;
        for id in ids {
            let has_hot_children = t.attempts.values().any(|a| a.notification_id == *id);
            let identical = matches!(
                (t.notifications.get(id), t.cold_notifications.get(id)),
                (Some(hot), Some(cold)) if hot == cold
            );
            if identical && !has_hot_children {
                t.notifications.remove(id);
                purged += 1;
            }
        }
        Ok(purged)
    }
}
