//! Chat rows: upsert, filtered listing, deletion, truncation.

use super::{clamp_limit, db_err, ChatStorage};
use gowa_core::GatewayError;
use tracing::info;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChatRow {
    pub device_id: String,
    pub jid: String,
    pub name: String,
    /// Unix seconds of the newest message in the chat.
    pub last_message_time: i64,
    pub ephemeral_expiration: Option<i64>,
}

/// Listing filter. Default order is `last_message_time DESC`.
#[derive(Debug, Clone, Default)]
pub struct ChatFilter {
    pub name_contains: Option<String>,
    pub has_media: bool,
    pub limit: i64,
    pub offset: i64,
}

/// Before/after row counts emitted for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateStats {
    pub chats_before: i64,
    pub messages_before: i64,
    pub chats_after: i64,
    pub messages_after: i64,
}

impl ChatStorage {
    /// Upsert a chat row. `created_at` is preserved on update; a missing
    /// ephemeral expiration keeps the prior value.
    pub async fn store_chat(&self, chat: &ChatRow) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO chats (device_id, jid, name, last_message_time, ephemeral_expiration) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(device_id, jid) DO UPDATE SET \
               name = excluded.name, \
               last_message_time = excluded.last_message_time, \
               ephemeral_expiration = COALESCE(excluded.ephemeral_expiration, chats.ephemeral_expiration), \
               updated_at = datetime('now')",
        )
        .bind(&chat.device_id)
        .bind(&chat.jid)
        .bind(&chat.name)
        .bind(chat.last_message_time)
        .bind(chat.ephemeral_expiration)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_chat(
        &self,
        device_id: &str,
        jid: &str,
    ) -> Result<Option<ChatRow>, GatewayError> {
        sqlx::query_as(
            "SELECT device_id, jid, name, last_message_time, ephemeral_expiration \
             FROM chats WHERE device_id = ? AND jid = ?",
        )
        .bind(device_id)
        .bind(jid)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Filtered chat listing, newest first. Row count is capped at 1000.
    pub async fn get_chats(
        &self,
        device_id: &str,
        filter: &ChatFilter,
    ) -> Result<Vec<ChatRow>, GatewayError> {
        let name = filter.name_contains.clone().unwrap_or_default();
        sqlx::query_as(
            "SELECT device_id, jid, name, last_message_time, ephemeral_expiration \
             FROM chats \
             WHERE device_id = ? \
               AND (? = '' OR name LIKE '%' || ? || '%') \
               AND (? = 0 OR EXISTS ( \
                     SELECT 1 FROM messages m \
                     WHERE m.device_id = chats.device_id \
                       AND m.chat_jid = chats.jid \
                       AND m.media_type != '')) \
             ORDER BY last_message_time DESC \
             LIMIT ? OFFSET ?",
        )
        .bind(device_id)
        .bind(&name)
        .bind(&name)
        .bind(filter.has_media as i64)
        .bind(clamp_limit(filter.limit))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Rename a chat. Used by the push-name drain after history sync.
    pub async fn update_chat_name(
        &self,
        device_id: &str,
        jid: &str,
        name: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE chats SET name = ?, updated_at = datetime('now') \
             WHERE device_id = ? AND jid = ?",
        )
        .bind(name)
        .bind(device_id)
        .bind(jid)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Delete a chat and its messages. Messages go first (FK order), both
    /// inside one transaction.
    pub async fn delete_chat(&self, device_id: &str, jid: &str) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM messages WHERE device_id = ? AND chat_jid = ?")
            .bind(device_id)
            .bind(jid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chats WHERE device_id = ? AND jid = ?")
            .bind(device_id)
            .bind(jid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Wipe every chat and message in the store, returning before/after
    /// counts for the audit trail.
    pub async fn truncate_all_chats(&self) -> Result<TruncateStats, GatewayError> {
        let (chats_before, messages_before) = self.get_statistics().await?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM messages")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chats")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let (chats_after, messages_after) = self.get_statistics().await?;

        info!(
            chats_before,
            messages_before, chats_after, messages_after, "truncated chat storage"
        );
        Ok(TruncateStats {
            chats_before,
            messages_before,
            chats_after,
            messages_after,
        })
    }
}
