//! Background auto-reconnect.

use crate::device::ConnectionState;
use crate::registry::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Spawn the reconnect ticker: every interval, any device whose persisted
/// state is logged-in but whose transport is down gets a reconnect attempt.
/// Failures are logged at debug and retried next tick; there is no
/// escalation at this layer.
pub fn spawn_auto_reconnect(
    registry: Arc<DeviceRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for handle in registry.handles().await {
                if handle.state().await != ConnectionState::LoggedIn {
                    continue;
                }
                if handle.is_transport_connected().await {
                    continue;
                }
                debug!(device_id = %handle.id, "auto-reconnect attempt");
                if let Err(e) = registry.reconnect(&handle.id).await {
                    debug!(device_id = %handle.id, "auto-reconnect failed: {e}");
                }
            }
        }
    })
}
