//! Recipient endpoint lookup and deactivation.
//!
//! The directory owns the addresses (emails, phone numbers, device tokens)
//! a user can be reached at. The dispatcher reads active endpoints and
//! reports endpoints that a provider rejected permanently.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::types::{Channel, RecipientEndpoint};

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Active endpoints on `channel`. `user_id = None` means every user of the tenant.
    async fn endpoints(
        &self,
        tenant_id: Uuid,
        user_id: Option<Uuid>,
        channel: Channel,
    ) -> anyhow::Result<Vec<RecipientEndpoint>>;

    /// Stop using `endpoint` for future notifications.
    async fn deactivate(&self, endpoint: &RecipientEndpoint, reason: &str) -> anyhow::Result<()>;
}

/// PostgreSQL-backed directory over `recipient_endpoints`.
#[derive(Clone)]
pub struct PgRecipientDirectory {
    pool: PgPool,
}

impl PgRecipientDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        channel: Channel,
        address: &str,
    ) -> anyhow::Result<RecipientEndpoint> {
        let endpoint = sqlx::query_as::<_, RecipientEndpoint>(
            r#"
            INSERT INTO recipient_endpoints (id, tenant_id, user_id, channel, address)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, user_id, channel, address)
            DO UPDATE SET active = TRUE, deactivated_at = NULL
            RETURNING id, tenant_id, user_id, channel, address, active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(user_id)
        .bind(channel)
        .bind(address)
        .fetch_one(&self.pool)
        .await?;

        Ok(endpoint)
    }
}

#[async_trait]
impl RecipientDirectory for PgRecipientDirectory {
    async fn endpoints(
        &self,
        tenant_id: Uuid,
        user_id: Option<Uuid>,
        channel: Channel,
    ) -> anyhow::Result<Vec<RecipientEndpoint>> {
        let rows = sqlx::query_as::<_, RecipientEndpoint>(
            r#"
            SELECT id, tenant_id, user_id, channel, address, active
            FROM recipient_endpoints
            WHERE tenant_id = $1
              AND channel = $2
              AND active = TRUE
              AND ($3::uuid IS NULL OR user_id = $3)
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(channel)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn deactivate(&self, endpoint: &RecipientEndpoint, reason: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE recipient_endpoints
            SET active = FALSE, deactivated_at = $2
            WHERE id = $1 AND active = TRUE
            "#,
        )
        .bind(endpoint.id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        tracing::info!(
            endpoint_id = %endpoint.id,
            user_id = %endpoint.user_id,
            channel = %endpoint.channel,
            reason,
            updated = result.rows_affected(),
            "Recipient endpoint deactivated"
        );
        Ok(())
    }
}

/// In-memory directory. Records every deactivation call it receives.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    endpoints: RwLock<Vec<RecipientEndpoint>>,
    deactivations: RwLock<Vec<Uuid>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tenant_id: Uuid, user_id: Uuid, channel: Channel, address: &str) -> RecipientEndpoint {
        let endpoint = RecipientEndpoint {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            channel,
            address: address.to_string(),
            active: true,
        };
        self.endpoints.write().push(endpoint.clone());
        endpoint
    }

    /// Endpoint ids passed to `deactivate`, one entry per call.
    pub fn deactivations(&self) -> Vec<Uuid> {
        self.deactivations.read().clone()
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn endpoints(
        &self,
        tenant_id: Uuid,
        user_id: Option<Uuid>,
        channel: Channel,
    ) -> anyhow::Result<Vec<RecipientEndpoint>> {
        Ok(self
            .endpoints
            .read()
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.channel == channel && e.active)
            .filter(|e| user_id.is_none_or(|u| e.user_id == u))
            .cloned()
            .collect())
    }

    async fn deactivate(&self, endpoint: &RecipientEndpoint, reason: &str) -> anyhow::Result<()> {
        self.deactivations.write().push(endpoint.id);
        if let Some(stored) = self
            .endpoints
            .write()
            .iter_mut()
            .find(|e| e.id == endpoint.id)
        {
            stored.active = false;
        }
        tracing::info!(endpoint_id = %endpoint.id, reason, "Recipient endpoint deactivated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deactivated_endpoints_are_skipped() {
        let dir = StaticDirectory::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let token = dir.add(tenant, user, Channel::Push, "device-token-1");
        dir.add(tenant, Uuid::new_v4(), Channel::Push, "device-token-2");

        assert_eq!(dir.endpoints(tenant, Some(user), Channel::Push).await.unwrap().len(), 1);
        assert_eq!(dir.endpoints(tenant, None, Channel::Push).await.unwrap().len(), 2);

        dir.deactivate(&token, "unregistered").await.unwrap();
        assert!(dir.endpoints(tenant, Some(user), Channel::Push).await.unwrap().is_empty());
        assert_eq!(dir.deactivations(), vec![token.id]);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_pg_directory_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        beacon_common::db::run_migrations(&pool).await.unwrap();
        let dir = PgRecipientDirectory::new(pool);
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let endpoint = dir.register(tenant, user, Channel::Sms, "+15550100").await.unwrap();
        assert_eq!(dir.endpoints(tenant, Some(user), Channel::Sms).await.unwrap(), vec![endpoint.clone()]);

        dir.deactivate(&endpoint, "invalid number").await.unwrap();
        assert!(dir.endpoints(tenant, None, Channel::Sms).await.unwrap().is_empty());
    }
}
