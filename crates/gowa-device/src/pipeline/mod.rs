//! Inbound event pipeline.
//!
//! One pipeline per device, fed by the transport's event stream. Every
//! message goes through identity normalization, chat upsert, content
//! extraction, LID migration, persistence, and webhook fan-out, in that
//! order. Receipts and protocol actions are fan-out only or joined against
//! storage as noted per handler.

mod extract;

#[cfg(test)]
mod tests;

pub use extract::{extract, ExtractedContent};

use crate::device::{ConnectionState, DeviceHandle};
use crate::resolver::LidResolver;
use crate::transport::{
    GroupAction, HistorySyncChunk, MessageMeta, ProtocolEvent, RawMessage,
};
use gowa_core::event::{names, ReceiptKind, WebhookEvent};
use gowa_core::jid::display_name;
use gowa_core::{GatewayError, Jid, WorkerConfig};
use gowa_storage::{ChatRow, ChatStorage, MessageRow};
use gowa_webhook::{Debouncer, WebhookDispatcher};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub struct EventPipeline {
    device: Arc<DeviceHandle>,
    storage: ChatStorage,
    resolver: Arc<LidResolver>,
    webhooks: WebhookDispatcher,
    config: WorkerConfig,
    history_debounce: Debouncer,
    /// Push-names learned during history sync, keyed by the user part.
    /// Drained into storage when the debounce window fires.
    push_names: RwLock<HashMap<String, String>>,
    /// Completed pn→lid migration pairs. Populated before the transaction;
    /// a rolled-back migration stays marked and is logged loudly instead of
    /// retried.
    migrated: Mutex<HashSet<String>>,
}

impl EventPipeline {
    pub fn new(
        device: Arc<DeviceHandle>,
        storage: ChatStorage,
        resolver: Arc<LidResolver>,
        webhooks: WebhookDispatcher,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let history_debounce = Debouncer::new(config.history_debounce());
        Arc::new(Self {
            device,
            storage,
            resolver,
            webhooks,
            config,
            history_debounce,
            push_names: RwLock::new(HashMap::new()),
            migrated: Mutex::new(HashSet::new()),
        })
    }

    pub fn resolver(&self) -> &Arc<LidResolver> {
        &self.resolver
    }

    /// Dedup probe: true when the message has already been persisted.
    pub async fn already_seen(&self, chat_jid: &str, id: &str) -> bool {
        self.storage
            .message_exists(&self.device.id, chat_jid, id)
            .await
            .unwrap_or(false)
    }

    /// Drive the pipeline until the transport drops its event sender.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ProtocolEvent>) {
        while let Some(event) = events.recv().await {
            Arc::clone(&self).handle_event(event).await;
        }
        debug!(device_id = %self.device.id, "event stream closed");
    }

    pub async fn handle_event(self: Arc<Self>, event: ProtocolEvent) {
        match event {
            ProtocolEvent::PairingQr { codes } => {
                self.device.set_qr(codes.into_iter().next());
            }
            ProtocolEvent::PairingCode { .. } => {}
            ProtocolEvent::PairSuccess { jid } => {
                info!(device_id = %self.device.id, %jid, "device paired");
                self.device.set_jid(Some(jid.to_non_ad())).await;
                self.device.set_state(ConnectionState::LoggedIn).await;
                self.device.set_qr(None);
                self.persist_device().await;
            }
            ProtocolEvent::Connected => {
                let state = if self.device.jid().await.is_some() {
                    ConnectionState::LoggedIn
                } else {
                    ConnectionState::Connected
                };
                self.device.set_state(state).await;
                self.device.set_qr(None);
                self.persist_device().await;
            }
            ProtocolEvent::Disconnected => {
                // State stays as-is; the auto-reconnect tick compares the
                // persisted state against the live transport.
                debug!(device_id = %self.device.id, "transport disconnected");
            }
            ProtocolEvent::LoggedOut => {
                warn!(device_id = %self.device.id, "logged out upstream");
                self.device.set_state(ConnectionState::LoggedOut).await;
                self.persist_device().await;
            }
            ProtocolEvent::Message(raw, meta) => {
                if let Err(e) = self.handle_message(&raw, &meta).await {
                    error!(device_id = %self.device.id, message_id = %meta.id, "message handling failed: {e}");
                }
            }
            ProtocolEvent::Receipt {
                chat,
                sender,
                ids,
                kind,
            } => {
                self.handle_receipt(chat, sender, ids, kind).await;
            }
            ProtocolEvent::GroupParticipants {
                group,
                action,
                participants,
            } => {
                self.handle_group_participants(group, action, participants)
                    .await;
            }
            ProtocolEvent::MessageRevoked { chat, sender, id } => {
                if let Err(e) = self.handle_revoked(chat, sender, id).await {
                    error!(device_id = %self.device.id, "revoke handling failed: {e}");
                }
            }
            ProtocolEvent::MessageEdited {
                chat,
                sender,
                id,
                new_text,
            } => {
                if let Err(e) = self.handle_edited(chat, sender, id, new_text).await {
                    error!(device_id = %self.device.id, "edit handling failed: {e}");
                }
            }
            ProtocolEvent::DeleteForMe { chat, sender, id } => {
                if let Err(e) = self.handle_delete_for_me(chat, sender, id).await {
                    error!(device_id = %self.device.id, "delete-for-me handling failed: {e}");
                }
            }
            ProtocolEvent::HistorySync(chunk) => {
                self.handle_history_sync(chunk).await;
            }
        }
    }

    // --- normalization -----------------------------------------------------

    /// Canonical chat form plus the phone-number form kept for display.
    ///
    /// Individual chats prefer `@lid` when a mapping exists; groups,
    /// broadcasts, and newsletters pass through. A phone-form chat with no
    /// persisted mapping falls back to the protocol lookup, learning the
    /// result.
    async fn normalize_chat(&self, chat: &Jid) -> (Jid, Option<Jid>) {
        let chat = chat.to_non_ad();
        if !chat.is_individual() {
            return (chat, None);
        }
        if chat.is_hidden() {
            let (pn, _) = self.resolver.resolve_to_pn_for_webhook(&chat).await;
            let pn = if pn.is_hidden() { None } else { Some(pn) };
            return (chat, pn);
        }

        let resolved = self.resolver.resolve_to_lid(&chat).await;
        if resolved.is_hidden() {
            return (resolved, Some(chat));
        }

        if let Some(transport) = self.device.transport().await {
            if let Some(lid) = transport.lookup_lid(&chat).await {
                if let Err(e) = self.resolver.learn(&chat.user, &lid.user).await {
                    warn!(device_id = %self.device.id, "failed to persist lid mapping: {e}");
                }
                return (lid.to_non_ad(), Some(chat));
            }
        }
        (chat.clone(), Some(chat))
    }

    /// Consolidate any phone-form history into the hidden-identifier form.
    /// The pair is marked done before the transaction; a failed migration
    /// is not retried and needs operator attention.
    async fn maybe_migrate(&self, pn: &Jid, lid: &Jid) {
        let key = format!("{}|{}", pn.user, lid.user);
        {
            let mut done = self.migrated.lock().await;
            if done.contains(&key) {
                return;
            }
            done.insert(key);
        }

        let pn_jid = pn.to_string();
        let lid_jid = lid.to_string();
        match self.storage.get_chat(&self.device.id, &pn_jid).await {
            Ok(Some(_)) => {
                if let Err(e) = self
                    .storage
                    .migrate_chat_to_lid(&self.device.id, &pn_jid, &lid_jid)
                    .await
                {
                    error!(
                        device_id = %self.device.id,
                        pn = %pn_jid,
                        lid = %lid_jid,
                        "LID MIGRATION FAILED and will not be retried until restart: {e}"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(device_id = %self.device.id, pn = %pn_jid, "lid migration pre-check failed: {e}");
            }
        }
    }

    // --- messages ----------------------------------------------------------

    async fn handle_message(&self, raw: &RawMessage, meta: &MessageMeta) -> Result<(), GatewayError> {
        let (chat, pn_chat) = self.normalize_chat(&meta.chat).await;
        let sender = self.resolver.resolve_to_lid(&meta.sender.to_non_ad()).await;

        if chat.is_hidden() {
            if let Some(pn) = &pn_chat {
                self.maybe_migrate(pn, &chat).await;
            }
        }

        let content = extract(raw);
        let chat_jid = chat.to_string();
        let name = self.chat_display_name(meta, &chat, pn_chat.as_ref()).await;
        self.storage
            .store_chat(&ChatRow {
                device_id: self.device.id.clone(),
                jid: chat_jid.clone(),
                name,
                last_message_time: meta.timestamp.timestamp(),
                ephemeral_expiration: content.ephemeral_expiration,
            })
            .await?;

        // No text, no media: nothing to persist or deliver.
        if content.is_empty() {
            return Ok(());
        }

        let fresh = !self.already_seen(&chat_jid, &meta.id).await;
        let row = self.build_row(&chat_jid, &sender, meta, &content);
        self.storage.store_message(&row).await?;

        let payload = self.message_payload(&chat_jid, &sender, meta, &content).await;
        self.webhooks
            .dispatch(WebhookEvent::new(names::MESSAGE, &self.device.id, payload));

        // External side effects observe at-most-once via the dedup probe.
        if fresh && !meta.is_from_me && meta.chat.is_individual() {
            self.apply_auto_actions(&chat, meta).await;
        }
        Ok(())
    }

    async fn chat_display_name(
        &self,
        meta: &MessageMeta,
        chat: &Jid,
        pn_chat: Option<&Jid>,
    ) -> String {
        if meta.is_group {
            // A message does not carry the group subject; keep what we have.
            match self.storage.get_chat(&self.device.id, &chat.to_string()).await {
                Ok(Some(existing)) if !existing.name.is_empty() => existing.name,
                _ => chat.user.clone(),
            }
        } else {
            let push_name = if meta.is_from_me { "" } else { meta.push_name.as_str() };
            display_name(push_name, pn_chat.unwrap_or(chat))
        }
    }

    fn build_row(
        &self,
        chat_jid: &str,
        sender: &Jid,
        meta: &MessageMeta,
        content: &ExtractedContent,
    ) -> MessageRow {
        let media = content.media.clone().unwrap_or_default();
        MessageRow {
            device_id: self.device.id.clone(),
            chat_jid: chat_jid.to_string(),
            id: meta.id.clone(),
            sender: sender.to_string(),
            content: content.text.clone(),
            timestamp: meta.timestamp.timestamp(),
            is_from_me: meta.is_from_me,
            media_type: content.media_type.clone(),
            filename: media.filename.unwrap_or_default(),
            url: media.url.unwrap_or_default(),
            media_key: media.media_key,
            file_sha256: media.file_sha256,
            file_enc_sha256: media.file_enc_sha256,
            file_length: media.file_length.unwrap_or(0) as i64,
            media_path: None,
        }
    }

    async fn message_payload(
        &self,
        chat_jid: &str,
        sender: &Jid,
        meta: &MessageMeta,
        content: &ExtractedContent,
    ) -> serde_json::Value {
        let (sender_pn, _) = self.resolver.resolve_to_pn_for_webhook(sender).await;
        let mut payload = json!({
            "message_id": meta.id,
            "chat_jid": chat_jid,
            "sender_jid": sender.to_string(),
            "sender_pn": sender_pn.to_string(),
            "push_name": meta.push_name,
            "content": content.text,
            "timestamp": meta.timestamp.to_rfc3339(),
            "is_from_me": meta.is_from_me,
            "is_group": meta.is_group,
        });
        if !content.media_type.is_empty() {
            if let Some(map) = payload.as_object_mut() {
                map.insert("media_type".into(), json!(content.media_type));
                if let Some(media) = &content.media {
                    if let Some(filename) = &media.filename {
                        map.insert("filename".into(), json!(filename));
                    }
                    if let Some(mimetype) = &media.mimetype {
                        map.insert("mimetype".into(), json!(mimetype));
                    }
                }
            }
        }
        payload
    }

    /// `chat` is the canonical chat JID the message was persisted under;
    /// the auto-reply record must land in the same chat row.
    async fn apply_auto_actions(&self, chat: &Jid, meta: &MessageMeta) {
        let Some(transport) = self.device.transport().await else {
            return;
        };
        if self.config.auto_mark_read {
            if let Err(e) = transport
                .mark_read(chat, std::slice::from_ref(&meta.id))
                .await
            {
                debug!(device_id = %self.device.id, "auto mark-read failed: {e}");
            }
        }
        if let Some(reply) = self.config.auto_reply.clone().filter(|r| !r.is_empty()) {
            match transport.send_text(chat, &reply).await {
                Ok(reply_id) => {
                    let sent = MessageRow {
                        device_id: self.device.id.clone(),
                        chat_jid: chat.to_string(),
                        id: reply_id,
                        sender: self
                            .device
                            .jid()
                            .await
                            .map(|j| j.to_string())
                            .unwrap_or_default(),
                        content: reply,
                        timestamp: chrono::Utc::now().timestamp(),
                        is_from_me: true,
                        ..Default::default()
                    };
                    if let Err(e) = self.storage.store_message(&sent).await {
                        warn!(device_id = %self.device.id, "failed to store auto-reply: {e}");
                    }
                }
                Err(e) => debug!(device_id = %self.device.id, "auto-reply send failed: {e}"),
            }
        }
    }

    // --- receipts and protocol actions -------------------------------------

    async fn handle_receipt(&self, chat: Jid, sender: Jid, ids: Vec<String>, kind: ReceiptKind) {
        // Receipts are not persisted; fan-out only.
        let (chat, _) = self.normalize_chat(&chat).await;
        let payload = json!({
            "chat_jid": chat.to_string(),
            "sender_jid": sender.to_non_ad().to_string(),
            "ids": ids,
            "receipt_type": kind.as_str(),
        });
        self.webhooks.dispatch(WebhookEvent::new(
            names::MESSAGE_ACK,
            &self.device.id,
            payload,
        ));
    }

    async fn handle_group_participants(
        &self,
        group: Jid,
        action: GroupAction,
        participants: Vec<Jid>,
    ) {
        let payload = json!({
            "group_jid": group.to_string(),
            "action": action,
            "participants": participants.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        });
        self.webhooks.dispatch(WebhookEvent::new(
            names::GROUP_PARTICIPANTS,
            &self.device.id,
            payload,
        ));
    }

    async fn handle_revoked(
        &self,
        chat: Jid,
        sender: Jid,
        id: String,
    ) -> Result<(), GatewayError> {
        let (chat, _) = self.normalize_chat(&chat).await;
        let chat_jid = chat.to_string();
        self.storage
            .delete_message(&self.device.id, &chat_jid, &id)
            .await?;
        let payload = json!({
            "chat_jid": chat_jid,
            "sender_jid": sender.to_non_ad().to_string(),
            "message_id": id,
        });
        self.webhooks.dispatch(WebhookEvent::new(
            names::MESSAGE_REVOKED,
            &self.device.id,
            payload,
        ));
        Ok(())
    }

    async fn handle_edited(
        &self,
        chat: Jid,
        sender: Jid,
        id: String,
        new_text: String,
    ) -> Result<(), GatewayError> {
        let (chat, _) = self.normalize_chat(&chat).await;
        let chat_jid = chat.to_string();
        self.storage
            .update_message_content(&self.device.id, &chat_jid, &id, &new_text)
            .await?;
        let payload = json!({
            "chat_jid": chat_jid,
            "sender_jid": sender.to_non_ad().to_string(),
            "message_id": id,
            "new_text": new_text,
        });
        self.webhooks.dispatch(WebhookEvent::new(
            names::MESSAGE_EDITED,
            &self.device.id,
            payload,
        ));
        Ok(())
    }

    /// Joins against storage for the original content and sender; an absent
    /// row just yields a smaller payload.
    async fn handle_delete_for_me(
        &self,
        chat: Jid,
        sender: Jid,
        id: String,
    ) -> Result<(), GatewayError> {
        let (chat, _) = self.normalize_chat(&chat).await;
        let chat_jid = chat.to_string();

        let original = self.storage.get_message_by_id(&self.device.id, &id).await?;
        let mut payload = json!({
            "chat_jid": chat_jid,
            "sender_jid": sender.to_non_ad().to_string(),
            "message_id": id,
        });
        if let Some(row) = &original {
            if let Some(map) = payload.as_object_mut() {
                map.insert("content".into(), json!(row.content));
                map.insert("original_sender".into(), json!(row.sender));
            }
        }

        self.storage
            .delete_message(&self.device.id, &chat_jid, &id)
            .await?;

        self.webhooks.dispatch(WebhookEvent::new(
            names::DELETE_FOR_ME,
            &self.device.id,
            payload,
        ));
        Ok(())
    }

    // --- history sync ------------------------------------------------------

    async fn handle_history_sync(self: Arc<Self>, chunk: HistorySyncChunk) {
        match chunk {
            HistorySyncChunk::Recent(items) => {
                if let Err(e) = self.ingest_history(items).await {
                    error!(device_id = %self.device.id, "history ingest failed: {e}");
                }
            }
            HistorySyncChunk::PushNames(pairs) => {
                self.push_names.write().await.extend(pairs);
            }
        }

        // Every fresh sync event restarts the quiet window.
        let pipeline = Arc::clone(&self);
        self.history_debounce
            .poke(move || async move {
                pipeline.finish_history_sync().await;
            })
            .await;
    }

    async fn ingest_history(
        &self,
        items: Vec<(RawMessage, MessageMeta)>,
    ) -> Result<(), GatewayError> {
        let mut rows = Vec::with_capacity(items.len());
        for (raw, meta) in &items {
            let (chat, pn_chat) = self.normalize_chat(&meta.chat).await;
            let sender = self.resolver.resolve_to_lid(&meta.sender.to_non_ad()).await;
            if chat.is_hidden() {
                if let Some(pn) = &pn_chat {
                    self.maybe_migrate(pn, &chat).await;
                }
            }

            let content = extract(raw);
            if content.is_empty() {
                continue;
            }
            let chat_jid = chat.to_string();
            let name = self.chat_display_name(meta, &chat, pn_chat.as_ref()).await;
            self.storage
                .store_chat(&ChatRow {
                    device_id: self.device.id.clone(),
                    jid: chat_jid.clone(),
                    name,
                    last_message_time: meta.timestamp.timestamp(),
                    ephemeral_expiration: content.ephemeral_expiration,
                })
                .await?;
            rows.push(self.build_row(&chat_jid, &sender, meta, &content));
        }
        let count = rows.len();
        self.storage.store_messages_batch(&rows).await?;
        debug!(device_id = %self.device.id, count, "ingested history chunk");
        Ok(())
    }

    /// Debounce fire: drain the push-name cache into storage, then emit a
    /// single `history_sync_complete` event.
    async fn finish_history_sync(&self) {
        let names_map = std::mem::take(&mut *self.push_names.write().await);
        let mut applied = 0usize;

        for (user, push_name) in &names_map {
            if push_name.is_empty() {
                continue;
            }
            let pn = Jid::pn(user.clone());
            let mut candidates = vec![self.resolver.resolve_to_lid(&pn).await, pn];
            candidates.dedup();
            for candidate in candidates {
                let jid = candidate.to_string();
                match self.storage.get_chat(&self.device.id, &jid).await {
                    Ok(Some(chat)) if name_is_placeholder(&chat.name, user) => {
                        if let Err(e) = self
                            .storage
                            .update_chat_name(&self.device.id, &jid, push_name)
                            .await
                        {
                            warn!(device_id = %self.device.id, "push-name apply failed: {e}");
                        } else {
                            applied += 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        info!(
            device_id = %self.device.id,
            cached = names_map.len(),
            applied,
            "history sync complete"
        );
        self.webhooks.dispatch(WebhookEvent::new(
            names::HISTORY_SYNC_COMPLETE,
            &self.device.id,
            json!({ "push_names_applied": applied }),
        ));
    }

    async fn persist_device(&self) {
        let row = self.device.row().await;
        if let Err(e) = self.storage.upsert_device(&row).await {
            warn!(device_id = %self.device.id, "failed to persist device state: {e}");
        }
    }
}

/// A chat name is replaceable by a push-name when it is empty, the
/// phone-number variant, or bare digits.
fn name_is_placeholder(name: &str, user: &str) -> bool {
    name.is_empty()
        || name == format!("+{user}")
        || name == user
        || name.chars().all(|c| c.is_ascii_digit())
}
