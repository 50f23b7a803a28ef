//! Phone-number ↔ hidden-identifier side-store and chat migration.

use super::{db_err, ChatStorage};
use gowa_core::GatewayError;
use tracing::info;

impl ChatStorage {
    /// Record a learned pn ↔ lid pair (user parts, no server suffix).
    pub async fn store_lid_mapping(
        &self,
        device_id: &str,
        pn_user: &str,
        lid_user: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO lid_map (device_id, pn_user, lid_user) VALUES (?, ?, ?) \
             ON CONFLICT(device_id, pn_user) DO UPDATE SET \
               lid_user = excluded.lid_user, \
               updated_at = datetime('now')",
        )
        .bind(device_id)
        .bind(pn_user)
        .bind(lid_user)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn lookup_lid(
        &self,
        device_id: &str,
        pn_user: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT lid_user FROM lid_map WHERE device_id = ? AND pn_user = ?")
                .bind(device_id)
                .bind(pn_user)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(lid,)| lid))
    }

    pub async fn lookup_pn(
        &self,
        device_id: &str,
        lid_user: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT pn_user FROM lid_map WHERE device_id = ? AND lid_user = ?")
                .bind(device_id)
                .bind(lid_user)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(pn,)| pn))
    }

    /// Consolidate a chat that straddles the phone-number and
    /// hidden-identifier forms into the hidden-identifier form.
    ///
    /// One transaction: if the lid chat row does not exist yet the
    /// phone-form row is renamed in place (the FK cascades the rename onto
    /// its messages); otherwise the messages are re-pointed and the
    /// phone-form row deleted. Senders matching the phone form are
    /// rewritten as well, which covers individual chats where
    /// sender == chat. After commit no row carries the phone form.
    pub async fn migrate_chat_to_lid(
        &self,
        device_id: &str,
        pn_jid: &str,
        lid_jid: &str,
    ) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let lid_exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM chats WHERE device_id = ? AND jid = ?")
                .bind(device_id)
                .bind(lid_jid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;

        if lid_exists.is_none() {
            sqlx::query(
                "UPDATE chats SET jid = ?, updated_at = datetime('now') \
                 WHERE device_id = ? AND jid = ?",
            )
            .bind(lid_jid)
            .bind(device_id)
            .bind(pn_jid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                "UPDATE messages SET chat_jid = ?, updated_at = datetime('now') \
                 WHERE device_id = ? AND chat_jid = ?",
            )
            .bind(lid_jid)
            .bind(device_id)
            .bind(pn_jid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            sqlx::query("DELETE FROM chats WHERE device_id = ? AND jid = ?")
                .bind(device_id)
                .bind(pn_jid)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        // Covers the rename path too: after the cascade, any stragglers
        // (present before the lid row existed) are re-pointed.
        sqlx::query(
            "UPDATE messages SET chat_jid = ?, updated_at = datetime('now') \
             WHERE device_id = ? AND chat_jid = ?",
        )
        .bind(lid_jid)
        .bind(device_id)
        .bind(pn_jid)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE messages SET sender = ?, updated_at = datetime('now') \
             WHERE device_id = ? AND sender = ?",
        )
        .bind(lid_jid)
        .bind(device_id)
        .bind(pn_jid)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        info!(device_id, pn_jid, lid_jid, "migrated chat to lid form");
        Ok(())
    }
}
