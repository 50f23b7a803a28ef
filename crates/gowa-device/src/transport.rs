//! Transport seam.
//!
//! The WhatsApp wire protocol is consumed through an opaque client library;
//! this module is the interface the core uses. A concrete binding maps the
//! client's events into [`ProtocolEvent`] and implements [`Transport`] for
//! commands. Tests drive the pipeline through a mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gowa_core::event::ReceiptKind;
use gowa_core::{GatewayError, Jid};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One media attachment as carried by the protocol message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPart {
    pub caption: Option<String>,
    pub mimetype: Option<String>,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub media_key: Option<Vec<u8>>,
    pub file_sha256: Option<Vec<u8>>,
    pub file_enc_sha256: Option<Vec<u8>>,
    pub file_length: Option<u64>,
}

/// Raw protocol message payload.
///
/// Mirrors the nesting of the upstream message structure: the real content
/// may sit behind `device_sent` / `ephemeral` / `view_once` wrappers, and
/// text lives either in `conversation` or in the extended-text variant.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image: Option<MediaPart>,
    pub audio: Option<MediaPart>,
    pub video: Option<MediaPart>,
    pub document: Option<MediaPart>,
    pub sticker: Option<MediaPart>,
    /// Disappearing-message expiry in seconds, when the chat carries one.
    pub ephemeral_expiration: Option<i64>,
    pub device_sent: Option<Box<RawMessage>>,
    pub ephemeral: Option<Box<RawMessage>>,
    pub view_once: Option<Box<RawMessage>>,
}

impl RawMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn image(caption: Option<&str>, mimetype: &str) -> Self {
        Self {
            image: Some(MediaPart {
                caption: caption.map(String::from),
                mimetype: Some(mimetype.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Delivery metadata attached to every inbound message.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub is_from_me: bool,
    pub is_group: bool,
    pub push_name: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageMeta {
    pub fn new(id: impl Into<String>, chat: Jid, sender: Jid) -> Self {
        let is_group = chat.is_group();
        Self {
            id: id.into(),
            chat,
            sender,
            is_from_me: false,
            is_group,
            push_name: String::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// History arrives in phases: message chunks first, push-name updates later.
#[derive(Debug, Clone)]
pub enum HistorySyncChunk {
    Recent(Vec<(RawMessage, MessageMeta)>),
    PushNames(Vec<(String, String)>),
}

/// Raw events emitted by the protocol client, one stream per device.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    PairingQr {
        codes: Vec<String>,
    },
    PairingCode {
        code: String,
    },
    PairSuccess {
        jid: Jid,
    },
    Connected,
    Disconnected,
    LoggedOut,
    Message(Box<RawMessage>, MessageMeta),
    Receipt {
        chat: Jid,
        sender: Jid,
        ids: Vec<String>,
        kind: ReceiptKind,
    },
    GroupParticipants {
        group: Jid,
        action: GroupAction,
        participants: Vec<Jid>,
    },
    MessageRevoked {
        chat: Jid,
        sender: Jid,
        id: String,
    },
    MessageEdited {
        chat: Jid,
        sender: Jid,
        id: String,
        new_text: String,
    },
    DeleteForMe {
        chat: Jid,
        sender: Jid,
        id: String,
    },
    HistorySync(HistorySyncChunk),
}

/// Commands the core issues against the protocol client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the connection using persisted session
    /// state. Pairing events arrive on the event stream.
    async fn connect(&self) -> Result<(), GatewayError>;

    async fn disconnect(&self);

    /// Log out upstream, invalidating the persisted session.
    async fn logout(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Send a text message; returns the upstream message id.
    async fn send_text(&self, to: &Jid, text: &str) -> Result<String, GatewayError>;

    async fn mark_read(&self, chat: &Jid, ids: &[String]) -> Result<(), GatewayError>;

    /// Phone-number pairing: returns the code the user types on the phone.
    async fn request_pairing_code(&self, phone: &str) -> Result<String, GatewayError>;

    /// Protocol-provided phone-number → hidden-identifier lookup.
    /// Best-effort; `None` is not an error.
    async fn lookup_lid(&self, pn: &Jid) -> Option<Jid>;
}

/// Materializes a transport for one device. The session path scopes the
/// client's persisted keys so devices never share state.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        device_id: &str,
        session_path: &Path,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Arc<dyn Transport>;
}
