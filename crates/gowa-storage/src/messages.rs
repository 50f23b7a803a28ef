//! Message rows: upsert, batch ingest, filtered reads, search.

use super::{clamp_limit, db_err, ChatStorage};
use gowa_core::GatewayError;

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct MessageRow {
    pub device_id: String,
    pub chat_jid: String,
    pub id: String,
    pub sender: String,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub is_from_me: bool,
    pub media_type: String,
    pub filename: String,
    pub url: String,
    pub media_key: Option<Vec<u8>>,
    pub file_sha256: Option<Vec<u8>>,
    pub file_enc_sha256: Option<Vec<u8>>,
    pub file_length: i64,
    /// Local path of the downloaded media. Monotonic: an upsert never
    /// replaces a set path with NULL.
    pub media_path: Option<String>,
}

impl MessageRow {
    pub fn has_media(&self) -> bool {
        !self.media_type.is_empty()
    }
}

/// Read filter; `chat_jid` is required, everything else optional.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub chat_jid: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub media_only: bool,
    pub is_from_me: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

const UPSERT_SQL: &str = "INSERT INTO messages \
    (device_id, chat_jid, id, sender, content, timestamp, is_from_me, media_type, \
     filename, url, media_key, file_sha256, file_enc_sha256, file_length, media_path) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
    ON CONFLICT(device_id, chat_jid, id) DO UPDATE SET \
      sender = excluded.sender, \
      content = excluded.content, \
      timestamp = excluded.timestamp, \
      is_from_me = excluded.is_from_me, \
      media_type = excluded.media_type, \
      filename = excluded.filename, \
      url = excluded.url, \
      media_key = excluded.media_key, \
      file_sha256 = excluded.file_sha256, \
      file_enc_sha256 = excluded.file_enc_sha256, \
      file_length = excluded.file_length, \
      media_path = COALESCE(excluded.media_path, messages.media_path), \
      updated_at = datetime('now')";

fn validate(msg: &MessageRow) -> Result<(), GatewayError> {
    if msg.content.is_empty() && msg.media_type.is_empty() {
        return Err(GatewayError::InvalidInput(
            "message has neither content nor media".into(),
        ));
    }
    Ok(())
}

async fn upsert<'e>(
    executor: impl sqlx::SqliteExecutor<'e>,
    msg: &MessageRow,
) -> Result<(), GatewayError> {
    sqlx::query(UPSERT_SQL)
        .bind(&msg.device_id)
        .bind(&msg.chat_jid)
        .bind(&msg.id)
        .bind(&msg.sender)
        .bind(&msg.content)
        .bind(msg.timestamp)
        .bind(msg.is_from_me)
        .bind(&msg.media_type)
        .bind(&msg.filename)
        .bind(&msg.url)
        .bind(&msg.media_key)
        .bind(&msg.file_sha256)
        .bind(&msg.file_enc_sha256)
        .bind(msg.file_length)
        .bind(&msg.media_path)
        .execute(executor)
        .await
        .map_err(db_err)?;
    Ok(())
}

impl ChatStorage {
    /// Upsert a single message. Rows with neither content nor media are
    /// rejected.
    pub async fn store_message(&self, msg: &MessageRow) -> Result<(), GatewayError> {
        validate(msg)?;
        upsert(&self.pool, msg).await
    }

    /// Batch upsert inside one transaction. Used by history-sync ingest;
    /// the statement is prepared once and reused across rows.
    pub async fn store_messages_batch(&self, msgs: &[MessageRow]) -> Result<(), GatewayError> {
        if msgs.is_empty() {
            return Ok(());
        }
        for msg in msgs {
            validate(msg)?;
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for msg in msgs {
            upsert(&mut *tx, msg).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Targeted media-path update after an async download completes.
    pub async fn update_message_media_path(
        &self,
        device_id: &str,
        chat_jid: &str,
        id: &str,
        media_path: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET media_path = ?, updated_at = datetime('now') \
             WHERE device_id = ? AND chat_jid = ? AND id = ?",
        )
        .bind(media_path)
        .bind(device_id)
        .bind(chat_jid)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Rewrite a message's text after an upstream edit.
    pub async fn update_message_content(
        &self,
        device_id: &str,
        chat_jid: &str,
        id: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET content = ?, updated_at = datetime('now') \
             WHERE device_id = ? AND chat_jid = ? AND id = ?",
        )
        .bind(content)
        .bind(device_id)
        .bind(chat_jid)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_message(
        &self,
        device_id: &str,
        chat_jid: &str,
        id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM messages WHERE device_id = ? AND chat_jid = ? AND id = ?")
            .bind(device_id)
            .bind(chat_jid)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Dedup probe: has this message already been persisted?
    pub async fn message_exists(
        &self,
        device_id: &str,
        chat_jid: &str,
        id: &str,
    ) -> Result<bool, GatewayError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM messages WHERE device_id = ? AND chat_jid = ? AND id = ?",
        )
        .bind(device_id)
        .bind(chat_jid)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Filtered message listing for one chat, newest first, capped at 1000.
    pub async fn get_messages(
        &self,
        device_id: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<MessageRow>, GatewayError> {
        if filter.chat_jid.is_empty() {
            return Err(GatewayError::InvalidInput("chat_jid is required".into()));
        }
        sqlx::query_as(
            "SELECT device_id, chat_jid, id, sender, content, timestamp, is_from_me, \
                    media_type, filename, url, media_key, file_sha256, file_enc_sha256, \
                    file_length, media_path \
             FROM messages \
             WHERE device_id = ? AND chat_jid = ? \
               AND (? = 0 OR timestamp >= ?) \
               AND (? = 0 OR timestamp <= ?) \
               AND (? = 0 OR media_type != '') \
               AND (? = 0 OR is_from_me = ?) \
             ORDER BY timestamp DESC \
             LIMIT ? OFFSET ?",
        )
        .bind(device_id)
        .bind(&filter.chat_jid)
        .bind(filter.start_time.is_some() as i64)
        .bind(filter.start_time.unwrap_or(0))
        .bind(filter.end_time.is_some() as i64)
        .bind(filter.end_time.unwrap_or(0))
        .bind(filter.media_only as i64)
        .bind(filter.is_from_me.is_some() as i64)
        .bind(filter.is_from_me.unwrap_or(false))
        .bind(clamp_limit(filter.limit))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Case-insensitive substring search within one chat. An empty search
    /// string returns an empty list rather than an error.
    pub async fn search_messages(
        &self,
        device_id: &str,
        chat_jid: &str,
        text: &str,
        limit: i64,
    ) -> Result<Vec<MessageRow>, GatewayError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as(
            "SELECT device_id, chat_jid, id, sender, content, timestamp, is_from_me, \
                    media_type, filename, url, media_key, file_sha256, file_enc_sha256, \
                    file_length, media_path \
             FROM messages \
             WHERE device_id = ? AND chat_jid = ? \
               AND LOWER(content) LIKE '%' || LOWER(?) || '%' \
             ORDER BY timestamp DESC \
             LIMIT ?",
        )
        .bind(device_id)
        .bind(chat_jid)
        .bind(text)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Direct lookup by upstream message id (uses the `id` index).
    pub async fn get_message_by_id(
        &self,
        device_id: &str,
        id: &str,
    ) -> Result<Option<MessageRow>, GatewayError> {
        sqlx::query_as(
            "SELECT device_id, chat_jid, id, sender, content, timestamp, is_from_me, \
                    media_type, filename, url, media_key, file_sha256, file_enc_sha256, \
                    file_length, media_path \
             FROM messages WHERE device_id = ? AND id = ? LIMIT 1",
        )
        .bind(device_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }
}
