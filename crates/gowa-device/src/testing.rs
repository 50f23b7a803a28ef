//! In-memory transport for tests.
//!
//! Lets pipeline and API tests inject protocol events and observe issued
//! commands without a wire connection.

use crate::transport::{ProtocolEvent, Transport, TransportFactory};
use async_trait::async_trait;
use gowa_core::{GatewayError, Jid};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MockTransport {
    pub connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub connect_calls: AtomicU64,
    pub sent: Mutex<Vec<(Jid, String)>>,
    pub read_marks: Mutex<Vec<(Jid, Vec<String>)>>,
    /// Protocol-side pn-user → lid-user directory.
    pub lid_directory: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn sent_texts(&self) -> Vec<(Jid, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn marks(&self) -> Vec<(Jid, Vec<String>)> {
        self.read_marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("mock connect failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<String, GatewayError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to.clone(), text.to_string()));
        Ok(format!("SENT{n}"))
    }

    async fn mark_read(&self, chat: &Jid, ids: &[String]) -> Result<(), GatewayError> {
        self.read_marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((chat.clone(), ids.to_vec()));
        Ok(())
    }

    async fn request_pairing_code(&self, _phone: &str) -> Result<String, GatewayError> {
        Ok("ABCD-1234".to_string())
    }

    async fn lookup_lid(&self, pn: &Jid) -> Option<Jid> {
        self.lid_directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pn.user)
            .map(|lid| Jid::lid(lid.clone()))
    }
}

/// Factory that remembers every created transport and its event sender so
/// tests can drive the pipeline.
#[derive(Default)]
pub struct MockTransportFactory {
    pub transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    pub event_senders: Mutex<HashMap<String, mpsc::Sender<ProtocolEvent>>>,
    /// Seed for each new transport's lid directory.
    pub lid_directory: Mutex<HashMap<String, String>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(&self, device_id: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Inject a protocol event into a device's pipeline.
    pub async fn emit(&self, device_id: &str, event: ProtocolEvent) {
        let sender = self
            .event_senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        device_id: &str,
        _session_path: &Path,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport::default());
        *transport.lid_directory.lock().unwrap_or_else(|e| e.into_inner()) = self
            .lid_directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), Arc::clone(&transport));
        self.event_senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), events);
        transport
    }
}
