//! Per-device runtime state and the connection state machine.

use crate::transport::Transport;
use gowa_core::Jid;
use gowa_storage::DeviceRow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Connection state machine:
///
/// `Registered → Connecting → Connected → LoggedIn`, with `LoggedOut` after
/// an upstream logout. A transport drop does not leave `LoggedIn`; the
/// auto-reconnect task uses the persisted state to decide what to revive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Registered,
    Connecting,
    Connected,
    LoggedIn,
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::LoggedIn => "logged_in",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "logged_in" => Ok(Self::LoggedIn),
            "logged_out" => Ok(Self::LoggedOut),
            _ => Err(()),
        }
    }
}

/// Read-only view of a device for listings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub jid: Option<String>,
    pub display_name: Option<String>,
    pub state: ConnectionState,
    pub connected: bool,
}

/// Runtime handle for one linked device. The registry owns the map of
/// these; everything inside is independently lockable so a read snapshot
/// never waits on a reconnect in progress.
pub struct DeviceHandle {
    pub id: String,
    state: RwLock<ConnectionState>,
    jid: RwLock<Option<Jid>>,
    display_name: RwLock<Option<String>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Latest pairing QR data; `None` outside a pairing window.
    qr: watch::Sender<Option<String>>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle").field("id", &self.id).finish()
    }
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, state: ConnectionState) -> Self {
        let (qr, _) = watch::channel(None);
        Self {
            id: id.into(),
            state: RwLock::new(state),
            jid: RwLock::new(None),
            display_name: RwLock::new(None),
            transport: RwLock::new(None),
            qr,
        }
    }

    pub fn from_row(row: &DeviceRow) -> Self {
        let (qr, _) = watch::channel(None);
        Self {
            id: row.device_id.clone(),
            state: RwLock::new(row.state.parse().unwrap_or(ConnectionState::Registered)),
            jid: RwLock::new(row.jid.as_deref().and_then(|j| j.parse().ok())),
            display_name: RwLock::new(row.display_name.clone()),
            transport: RwLock::new(None),
            qr,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    pub async fn jid(&self) -> Option<Jid> {
        self.jid.read().await.clone()
    }

    pub async fn set_jid(&self, jid: Option<Jid>) {
        *self.jid.write().await = jid;
    }

    pub async fn display_name(&self) -> Option<String> {
        self.display_name.read().await.clone()
    }

    pub async fn set_display_name(&self, name: Option<String>) {
        *self.display_name.write().await = name;
    }

    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().await.clone()
    }

    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport);
    }

    pub async fn clear_transport(&self) {
        *self.transport.write().await = None;
    }

    pub async fn is_transport_connected(&self) -> bool {
        match self.transport().await {
            Some(transport) => transport.is_connected(),
            None => false,
        }
    }

    pub fn subscribe_qr(&self) -> watch::Receiver<Option<String>> {
        self.qr.subscribe()
    }

    pub fn set_qr(&self, code: Option<String>) {
        // send_replace keeps the latest value even with no live receiver,
        // so a late login call still observes the buffered code.
        self.qr.send_replace(code);
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.id.clone(),
            jid: self.jid().await.map(|j| j.to_string()),
            display_name: self.display_name().await,
            state: self.state().await,
            connected: self.is_transport_connected().await,
        }
    }

    /// Persisted form of the current state.
    pub async fn row(&self) -> DeviceRow {
        DeviceRow {
            device_id: self.id.clone(),
            jid: self.jid().await.map(|j| j.to_string()),
            display_name: self.display_name().await,
            state: self.state().await.as_str().to_string(),
        }
    }
}
