//! Device registry: the single coordination point for per-device state.

use crate::device::{ConnectionState, DeviceHandle, DeviceSnapshot};
use crate::pipeline::EventPipeline;
use crate::qr::generate_qr_png;
use crate::resolver::LidResolver;
use crate::transport::{Transport, TransportFactory};
use gowa_core::{GatewayError, Jid, WorkerConfig};
use gowa_storage::{ChatRow, ChatStorage, MessageRow};
use gowa_webhook::WebhookDispatcher;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the operator wants to authenticate a new pairing.
pub enum LoginMethod {
    Qr,
    Code { phone: String },
}

/// Displayable login artifact.
#[derive(Debug)]
pub enum LoginArtifact {
    QrPng(Vec<u8>),
    PairCode(String),
}

/// How long login waits for the first QR code from the transport.
const QR_WAIT: Duration = Duration::from_secs(30);

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
    pipelines: RwLock<HashMap<String, Arc<EventPipeline>>>,
    pipeline_tasks: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    storage: ChatStorage,
    factory: Arc<dyn TransportFactory>,
    webhooks: WebhookDispatcher,
    config: WorkerConfig,
}

impl DeviceRegistry {
    pub fn new(
        storage: ChatStorage,
        factory: Arc<dyn TransportFactory>,
        webhooks: WebhookDispatcher,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            pipelines: RwLock::new(HashMap::new()),
            pipeline_tasks: RwLock::new(HashMap::new()),
            storage,
            factory,
            webhooks,
            config,
        })
    }

    pub fn storage(&self) -> &ChatStorage {
        &self.storage
    }

    /// Rehydrate registered devices from storage. Previously logged-in
    /// devices get their transport back immediately; everything else stays
    /// lazy until the next login.
    pub async fn load_persisted(&self) -> Result<usize, GatewayError> {
        let rows = self.storage.list_devices().await?;
        let count = rows.len();
        for row in rows {
            let handle = Arc::new(DeviceHandle::from_row(&row));
            let id = handle.id.clone();
            self.devices.write().await.insert(id.clone(), Arc::clone(&handle));

            if handle.state().await == ConnectionState::LoggedIn {
                let transport = self.ensure_transport(&handle).await;
                if let Err(e) = transport.connect().await {
                    debug!(device_id = %id, "startup reconnect failed: {e}");
                }
            }
        }
        info!(count, "loaded persisted devices");
        Ok(count)
    }

    fn session_path(&self, device_id: &str) -> PathBuf {
        PathBuf::from(&self.config.storage_root)
            .join(device_id)
            .join("whatsapp.db")
    }

    /// Materialize the transport and its pipeline for a device, on demand.
    async fn ensure_transport(&self, handle: &Arc<DeviceHandle>) -> Arc<dyn Transport> {
        if let Some(transport) = handle.transport().await {
            return transport;
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let transport =
            self.factory
                .create(&handle.id, &self.session_path(&handle.id), events_tx);
        handle.set_transport(Arc::clone(&transport)).await;

        let resolver = Arc::new(LidResolver::new(
            handle.id.clone(),
            self.storage.clone(),
            self.config.resolver_ttl(),
        ));
        resolver.spawn_sweeper();

        let pipeline = EventPipeline::new(
            Arc::clone(handle),
            self.storage.clone(),
            resolver,
            self.webhooks.clone(),
            self.config.clone(),
        );
        let task = tokio::spawn(Arc::clone(&pipeline).run(events_rx));
        self.pipelines
            .write()
            .await
            .insert(handle.id.clone(), pipeline);
        self.pipeline_tasks
            .write()
            .await
            .insert(handle.id.clone(), task);

        transport
    }

    pub async fn pipeline(&self, device_id: &str) -> Option<Arc<EventPipeline>> {
        self.pipelines.read().await.get(device_id).cloned()
    }

    /// Register a device placeholder. No transport is allocated until the
    /// first login.
    pub async fn create(&self, device_id: Option<String>) -> Result<DeviceSnapshot, GatewayError> {
        let id = match device_id {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        let mut devices = self.devices.write().await;
        if devices.contains_key(&id) {
            return Err(GatewayError::AlreadyExists(id));
        }
        let handle = Arc::new(DeviceHandle::new(id.clone(), ConnectionState::Registered));
        devices.insert(id.clone(), Arc::clone(&handle));
        drop(devices);

        self.storage.upsert_device(&handle.row().await).await?;
        info!(device_id = %id, "device registered");
        Ok(handle.snapshot().await)
    }

    /// Start authentication, returning a QR image or pairing code.
    pub async fn login(
        &self,
        device_id: &str,
        method: LoginMethod,
    ) -> Result<LoginArtifact, GatewayError> {
        let handle = self.require(device_id).await?;
        if handle.state().await == ConnectionState::LoggedIn {
            return Err(GatewayError::InvalidInput(format!(
                "device {device_id} is already logged in"
            )));
        }

        let transport = self.ensure_transport(&handle).await;
        handle.set_state(ConnectionState::Connecting).await;
        handle.set_qr(None);
        self.persist(&handle).await;

        let mut qr_rx = handle.subscribe_qr();
        transport.connect().await?;

        match method {
            LoginMethod::Qr => {
                let code = tokio::time::timeout(QR_WAIT, async move {
                    loop {
                        if let Some(code) = qr_rx.borrow_and_update().clone() {
                            return Some(code);
                        }
                        if qr_rx.changed().await.is_err() {
                            return None;
                        }
                    }
                })
                .await
                .map_err(|_| {
                    GatewayError::Transport("timed out waiting for a pairing QR code".into())
                })?
                .ok_or_else(|| {
                    GatewayError::Transport("pairing channel closed unexpectedly".into())
                })?;
                Ok(LoginArtifact::QrPng(generate_qr_png(&code)?))
            }
            LoginMethod::Code { phone } => {
                let code = transport.request_pairing_code(&phone).await?;
                Ok(LoginArtifact::PairCode(code))
            }
        }
    }

    /// Idempotent reconnect using the persisted session. Already connected
    /// or logged-in devices are a no-op success.
    pub async fn reconnect(
        &self,
        device_id: &str,
    ) -> Result<ConnectionState, GatewayError> {
        let handle = self.require(device_id).await?;
        let state = handle.state().await;

        if matches!(state, ConnectionState::Connected | ConnectionState::LoggedIn)
            && handle.is_transport_connected().await
        {
            return Ok(state);
        }

        let transport = self.ensure_transport(&handle).await;
        transport.connect().await?;
        Ok(handle.state().await)
    }

    /// Destructive logout: terminate the transport, purge device-scoped
    /// storage, drop the registry entry. Storage cleanup failure aborts
    /// the removal.
    pub async fn logout(&self, device_id: &str) -> Result<(), GatewayError> {
        let handle = self.require(device_id).await?;

        if let Some(transport) = handle.transport().await {
            if let Err(e) = transport.logout().await {
                warn!(device_id, "upstream logout failed (continuing): {e}");
            }
            transport.disconnect().await;
        }
        handle.clear_transport().await;

        // The chat rows are the authoritative artifact: failure here is
        // fatal and leaves the registry entry in place.
        self.storage.purge_device(device_id).await?;

        if let Some(task) = self.pipeline_tasks.write().await.remove(device_id) {
            task.abort();
        }
        self.pipelines.write().await.remove(device_id);
        self.devices.write().await.remove(device_id);

        // Session files are best-effort.
        let session_dir = PathBuf::from(&self.config.storage_root).join(device_id);
        if session_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&session_dir) {
                warn!(device_id, "failed to remove session dir: {e}");
            }
        }

        info!(device_id, "device logged out and purged");
        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.read().await.get(device_id).cloned()
    }

    async fn require(&self, device_id: &str) -> Result<Arc<DeviceHandle>, GatewayError> {
        self.get(device_id)
            .await
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))
    }

    pub async fn list(&self) -> Vec<DeviceSnapshot> {
        let handles: Vec<Arc<DeviceHandle>> =
            self.devices.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    pub async fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Device resolution for device-scoped requests: explicit header wins,
    /// then the query parameter, then the sole registered device.
    pub async fn resolve(
        &self,
        header: Option<&str>,
        query: Option<&str>,
    ) -> Result<Arc<DeviceHandle>, GatewayError> {
        if let Some(id) = header.or(query).filter(|id| !id.is_empty()) {
            return self.require(id).await;
        }
        let devices = self.devices.read().await;
        if devices.len() == 1 {
            if let Some(handle) = devices.values().next() {
                return Ok(Arc::clone(handle));
            }
        }
        Err(GatewayError::DeviceIdRequired)
    }

    /// Guard for operations that need an authenticated session.
    pub async fn require_logged_in(&self, handle: &DeviceHandle) -> Result<(), GatewayError> {
        if handle.state().await != ConnectionState::LoggedIn {
            return Err(GatewayError::DeviceNotLoggedIn(handle.id.clone()));
        }
        Ok(())
    }

    /// Send a text message through a device and record the sent message.
    pub async fn send_text(
        &self,
        handle: &Arc<DeviceHandle>,
        to: &Jid,
        text: &str,
    ) -> Result<String, GatewayError> {
        self.require_logged_in(handle).await?;
        let transport = handle
            .transport()
            .await
            .ok_or_else(|| GatewayError::DeviceNotLoggedIn(handle.id.clone()))?;

        let to = match self.pipeline(&handle.id).await {
            Some(pipeline) => pipeline.resolver().resolve_to_lid(&to.to_non_ad()).await,
            None => to.to_non_ad(),
        };

        let message_id = transport.send_text(&to, text).await?;

        let chat_jid = to.to_string();
        let existing_name = self
            .storage
            .get_chat(&handle.id, &chat_jid)
            .await
            .ok()
            .flatten()
            .map(|c| c.name)
            .filter(|n| !n.is_empty());
        self.storage
            .store_chat(&ChatRow {
                device_id: handle.id.clone(),
                jid: chat_jid.clone(),
                name: existing_name.unwrap_or_else(|| to.display_fallback()),
                last_message_time: chrono::Utc::now().timestamp(),
                ephemeral_expiration: None,
            })
            .await?;
        self.storage
            .store_message(&MessageRow {
                device_id: handle.id.clone(),
                chat_jid,
                id: message_id.clone(),
                sender: handle
                    .jid()
                    .await
                    .map(|j| j.to_string())
                    .unwrap_or_default(),
                content: text.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                is_from_me: true,
                ..Default::default()
            })
            .await?;

        Ok(message_id)
    }

    pub async fn persist(&self, handle: &DeviceHandle) {
        if let Err(e) = self.storage.upsert_device(&handle.row().await).await {
            warn!(device_id = %handle.id, "failed to persist device: {e}");
        }
    }
}
