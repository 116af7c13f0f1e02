//! Device directory seam — read-only token lookup plus invalid-token purge.
//!
//! The directory itself belongs to the wider application; this crate only
//! consumes it. `PgDeviceDirectory` queries the shared `user_devices` table.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::CourierError;

/// One registered device with a push token.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceRecord {
    pub user_id: Uuid,
    pub device_id: String,
    pub push_token: String,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn devices_for_users(&self, users: &[Uuid]) -> Result<Vec<DeviceRecord>, CourierError>;

    /// Remove devices whose tokens the provider rejected as invalid.
    /// Returns the number of rows purged.
    async fn remove_devices_by_tokens(&self, tokens: &[String]) -> Result<u64, CourierError>;
}

/// Postgres-backed directory over the application's `user_devices` table.
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn devices_for_users(&self, users: &[Uuid]) -> Result<Vec<DeviceRecord>, CourierError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<DeviceRecord> = sqlx::query_as(
            r#"
            SELECT user_id, device_id, push_token
            FROM user_devices
            WHERE user_id = ANY($1)
              AND push_token IS NOT NULL
            "#,
        )
        .bind(users)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn remove_devices_by_tokens(&self, tokens: &[String]) -> Result<u64, CourierError> {
        if tokens.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM user_devices WHERE push_token = ANY($1)")
            .bind(tokens)
            .execute(&self.pool)
            .await?;

        tracing::info!(purged = result.rows_affected(), "Removed invalid push tokens");
        Ok(result.rows_affected())
    }
}
