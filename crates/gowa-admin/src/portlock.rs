//! Cross-process port locks.
//!
//! Advisory file locks under a shared directory guard every create, update,
//! and delete of a worker. Acquisition polls with a deadline; contention
//! surfaces as `PortLocked`. The guard releases on drop, so every exit
//! path (success, error, panic) lets the lock go.

use gowa_core::GatewayError;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds `<lock_dir>/port_<port>.lock` until dropped.
#[derive(Debug)]
pub struct PortLock {
    port: u16,
    release: Option<oneshot::Sender<()>>,
}

impl PortLock {
    pub fn lock_path(lock_dir: &Path, port: u16) -> PathBuf {
        lock_dir.join(format!("port_{port}.lock"))
    }

    /// Acquire the advisory lock for a port, polling until the timeout.
    pub async fn acquire(
        lock_dir: &Path,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        std::fs::create_dir_all(lock_dir)?;
        let path = Self::lock_path(lock_dir, port);
        let deadline = Instant::now() + timeout;

        let (acquired_tx, acquired_rx) = oneshot::channel::<Result<(), GatewayError>>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // The flock is held by a blocking thread for the (short) life of
        // the guard; dropping the guard signals it to unlock.
        tokio::task::spawn_blocking(move || {
            let file = match OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) => {
                    let _ = acquired_tx.send(Err(GatewayError::Io(e)));
                    return;
                }
            };
            let mut lock = fd_lock::RwLock::new(file);
            loop {
                match lock.try_write() {
                    Ok(_guard) => {
                        if acquired_tx.send(Ok(())).is_err() {
                            return;
                        }
                        // Hold the flock until the guard drops.
                        let _ = release_rx.blocking_recv();
                        return;
                    }
                    Err(_) => {
                        if Instant::now() >= deadline {
                            let _ = acquired_tx.send(Err(GatewayError::PortLocked(port)));
                            return;
                        }
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        });

        match acquired_rx.await {
            Ok(Ok(())) => {
                debug!(port, "port lock acquired");
                Ok(Self {
                    port,
                    release: Some(release_tx),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::PortLocked(port)),
        }
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
        debug!(port = self.port, "port lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contention_yields_port_locked() {
        let dir = tempfile::tempdir().unwrap();
        let held = PortLock::acquire(dir.path(), 3005, Duration::from_millis(100))
            .await
            .unwrap();

        let err = PortLock::acquire(dir.path(), 3005, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PortLocked(3005)));

        drop(held);
    }

    #[tokio::test]
    async fn release_allows_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _held = PortLock::acquire(dir.path(), 3006, Duration::from_millis(100))
                .await
                .unwrap();
        }
        // Give the holder thread a beat to drop the flock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        PortLock::acquire(dir.path(), 3006, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn different_ports_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = PortLock::acquire(dir.path(), 3001, Duration::from_millis(100))
            .await
            .unwrap();
        let _b = PortLock::acquire(dir.path(), 3002, Duration::from_millis(100))
            .await
            .unwrap();
    }
}
