//! Process wiring for the worker and admin modes.

use async_trait::async_trait;
use gowa_admin::audit::AuditLogger;
use gowa_admin::{AdminState, HttpSupervisor, Supervisor};
use gowa_core::{AdminConfig, GatewayError, Jid, WorkerConfig};
use gowa_device::reconnect::spawn_auto_reconnect;
use gowa_device::transport::{ProtocolEvent, Transport, TransportFactory};
use gowa_device::DeviceRegistry;
use gowa_storage::ChatStorage;
use gowa_webhook::{WebhookConfig, WebhookDispatcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Binding point for the wire protocol client.
///
/// The gateway core is client-agnostic: a deployment links its protocol
/// client crate and implements [`TransportFactory`] here. This build ships
/// without one; the HTTP surface, storage, and webhook pipeline are fully
/// operational, and connection attempts report a transport error instead.
struct UnboundTransportFactory;

struct UnboundTransport;

fn unbound() -> GatewayError {
    GatewayError::Transport(
        "no wire protocol client is bound in this build; link one via TransportFactory".into(),
    )
}

#[async_trait]
impl Transport for UnboundTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        Err(unbound())
    }

    async fn disconnect(&self) {}

    async fn logout(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send_text(&self, _to: &Jid, _text: &str) -> Result<String, GatewayError> {
        Err(unbound())
    }

    async fn mark_read(&self, _chat: &Jid, _ids: &[String]) -> Result<(), GatewayError> {
        Err(unbound())
    }

    async fn request_pairing_code(&self, _phone: &str) -> Result<String, GatewayError> {
        Err(unbound())
    }

    async fn lookup_lid(&self, _pn: &Jid) -> Option<Jid> {
        None
    }
}

impl TransportFactory for UnboundTransportFactory {
    fn create(
        &self,
        _device_id: &str,
        _session_path: &Path,
        _events: mpsc::Sender<ProtocolEvent>,
    ) -> Arc<dyn Transport> {
        Arc::new(UnboundTransport)
    }
}

pub async fn run_worker(config_path: Option<&str>, port: u16) -> anyhow::Result<()> {
    let mut config = WorkerConfig::load(config_path.map(Path::new))?;
    config.port = port;

    let storage = ChatStorage::open(config.chat_db_path().as_deref()).await?;
    let webhooks = WebhookDispatcher::new(WebhookConfig::from_worker(&config))?;
    let registry = DeviceRegistry::new(
        storage,
        Arc::new(UnboundTransportFactory),
        webhooks,
        config.clone(),
    );
    registry.load_persisted().await?;

    let _reconnect = spawn_auto_reconnect(Arc::clone(&registry), config.reconnect_interval());

    let app = crate::server::router(crate::server::WorkerState {
        registry,
        config: Arc::new(config.clone()),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("worker listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await?;
    Ok(())
}

pub async fn run_admin() -> anyhow::Result<()> {
    // Refuses to start without ADMIN_TOKEN.
    let config = AdminConfig::from_env()?;

    let supervisor: Arc<dyn Supervisor> = Arc::new(HttpSupervisor::new(
        config.supervisor_url.clone(),
        config.supervisor_user.clone(),
        config.supervisor_pass.clone(),
    )?);
    let audit = AuditLogger::open(Some(&config.instances_dir.join("admin_audit.db"))).await?;

    let addr = format!("0.0.0.0:{}", config.admin_port);
    let state = AdminState::new(config, supervisor, audit);
    let app = gowa_admin::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("admin API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await?;
    Ok(())
}
