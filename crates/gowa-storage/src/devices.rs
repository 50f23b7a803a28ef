//! Persisted device registry rows.

use super::{db_err, ChatStorage};
use gowa_core::GatewayError;
use tracing::info;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: String,
    pub jid: Option<String>,
    pub display_name: Option<String>,
    pub state: String,
}

impl ChatStorage {
    pub async fn upsert_device(&self, device: &DeviceRow) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO devices (device_id, jid, display_name, state) VALUES (?, ?, ?, ?) \
             ON CONFLICT(device_id) DO UPDATE SET \
               jid = excluded.jid, \
               display_name = excluded.display_name, \
               state = excluded.state, \
               updated_at = datetime('now')",
        )
        .bind(&device.device_id)
        .bind(&device.jid)
        .bind(&device.display_name)
        .bind(&device.state)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRow>, GatewayError> {
        sqlx::query_as(
            "SELECT device_id, jid, display_name, state FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRow>, GatewayError> {
        sqlx::query_as(
            "SELECT device_id, jid, display_name, state FROM devices ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Remove every row owned by a device: messages, chats, identity
    /// mappings, then the device itself, in one transaction. Used by
    /// logout.
    pub async fn purge_device(&self, device_id: &str) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM messages WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chats WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM lid_map WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        info!(device_id, "purged device storage");
        Ok(())
    }
}
