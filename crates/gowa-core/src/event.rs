//! Normalized event envelope for webhook fan-out.
//!
//! Every event delivered to subscribers carries the same envelope:
//! `{event, device_id, payload, timestamp}`. Message events flatten the
//! message fields to the top level (keeping `device_id`) so sinks that only
//! care about messages read a stable shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names on the wire.
pub mod names {
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ACK: &str = "message.ack";
    pub const GROUP_PARTICIPANTS: &str = "group.participants";
    pub const MESSAGE_REVOKED: &str = "message_revoked";
    pub const MESSAGE_EDITED: &str = "message_edited";
    pub const DELETE_FOR_ME: &str = "event.delete_for_me";
    pub const HISTORY_SYNC_COMPLETE: &str = "history_sync_complete";
}

/// Acknowledgment type attached to `message.ack` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
    Sender,
    Retry,
    Played,
    PlayedSelf,
    ReadSelf,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Sender => "sender",
            Self::Retry => "retry",
            Self::Played => "played",
            Self::PlayedSelf => "played_self",
            Self::ReadSelf => "read_self",
        }
    }
}

/// A normalized event ready for fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub device_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(event: impl Into<String>, device_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            device_id: device_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The JSON body sent over the wire. Message events are flattened so
    /// the message fields sit at the top level next to `device_id`.
    pub fn to_body(&self) -> Value {
        if self.event == names::MESSAGE {
            let mut body = self.payload.clone();
            if let Some(map) = body.as_object_mut() {
                map.insert("event".into(), Value::String(self.event.clone()));
                map.insert("device_id".into(), Value::String(self.device_id.clone()));
                map.insert(
                    "timestamp".into(),
                    Value::String(self.timestamp.to_rfc3339()),
                );
                return body;
            }
        }
        serde_json::json!({
            "event": self.event,
            "device_id": self.device_id,
            "payload": self.payload,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
