//! Worker instance lifecycle.
//!
//! One worker per port, named `gowa_<port>`, declared by a config file in
//! the supervisor's conf directory. The config file is the source of
//! truth: create writes it before starting, delete removes it last and
//! treats that removal as the only fatal cleanup step.

use crate::metrics;
use crate::portlock::PortLock;
use crate::supervisor::{ProcessInfo, ProcessState, Supervisor};
use gowa_core::{AdminConfig, GatewayError, InstanceOverrides};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const WORKER_PREFIX: &str = "gowa_";

/// Poll cadence while waiting for a started worker to report Running.
const START_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub port: u16,
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<i64>,
    pub uptime_secs: Option<i64>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
}

impl InstanceInfo {
    fn from_process(port: u16, process: &ProcessInfo) -> Self {
        Self {
            port,
            name: process.name.clone(),
            state: process.state,
            pid: process.pid,
            uptime_secs: process.uptime_secs,
            stdout_log: process.stdout_log.clone(),
            stderr_log: process.stderr_log.clone(),
        }
    }
}

pub fn worker_name(port: u16) -> String {
    format!("{WORKER_PREFIX}{port}")
}

pub fn parse_worker_port(name: &str) -> Option<u16> {
    name.strip_prefix(WORKER_PREFIX)?.parse().ok()
}

/// Ports below 1024 are privileged; reject them and anything out of range.
pub fn validate_port(port: i64) -> Result<u16, GatewayError> {
    if (1024..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(GatewayError::InvalidPort(port))
    }
}

pub struct InstanceManager {
    config: AdminConfig,
    supervisor: Arc<dyn Supervisor>,
}

impl InstanceManager {
    pub fn new(config: AdminConfig, supervisor: Arc<dyn Supervisor>) -> Self {
        Self { config, supervisor }
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    fn conf_path(&self, port: u16) -> PathBuf {
        self.config.conf_dir.join(format!("{}.conf", worker_name(port)))
    }

    fn instance_dir(&self, port: u16) -> PathBuf {
        self.config.instances_dir.join(worker_name(port))
    }

    fn port_free_on_host(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Render the supervisor program block for a worker.
    fn render_conf(&self, port: u16, overrides: &InstanceOverrides) -> String {
        let name = worker_name(port);
        let instance_dir = self.instance_dir(port);
        let log_dir = &self.config.log_dir;

        let mut env = vec![format!("GOWA_PORT=\"{port}\"")];
        let mut push = |key: &str, value: String| env.push(format!("{key}=\"{value}\""));
        if let Some(v) = &overrides.basic_auth {
            push("GOWA_BASIC_AUTH", v.clone());
        }
        if let Some(v) = overrides.debug {
            push("GOWA_DEBUG", v.to_string());
        }
        if let Some(v) = &overrides.os {
            push("GOWA_OS", v.clone());
        }
        if let Some(v) = overrides.account_validation {
            push("GOWA_ACCOUNT_VALIDATION", v.to_string());
        }
        if let Some(v) = &overrides.base_path {
            push("GOWA_BASE_PATH", v.clone());
        }
        if let Some(v) = &overrides.auto_reply {
            push("GOWA_AUTO_REPLY", v.clone());
        }
        if let Some(v) = overrides.auto_mark_read {
            push("GOWA_AUTO_MARK_READ", v.to_string());
        }
        if let Some(v) = &overrides.webhook {
            push("GOWA_WEBHOOK", v.clone());
        }
        if let Some(v) = &overrides.webhook_secret {
            push("GOWA_WEBHOOK_SECRET", v.clone());
        }
        if let Some(v) = overrides.chat_storage {
            push("GOWA_CHAT_STORAGE", v.to_string());
        }

        format!(
            "[program:{name}]\n\
             command={bin} rest --port {port}\n\
             directory={dir}\n\
             autostart=false\n\
             autorestart=true\n\
             startsecs=3\n\
             stopwaitsecs=10\n\
             stdout_logfile={logs}/{name}.out\n\
             stderr_logfile={logs}/{name}.err\n\
             environment={env}\n",
            bin = self.config.gowa_bin,
            dir = instance_dir.display(),
            logs = log_dir.display(),
            env = env.join(","),
        )
    }

    async fn wait_for_running(&self, name: &str) -> Result<ProcessInfo, GatewayError> {
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            match self.supervisor.get_process_info(name).await? {
                Some(info) if info.state == ProcessState::Running => return Ok(info),
                Some(info) if info.state == ProcessState::Fatal => {
                    return Err(GatewayError::StartFailed(format!(
                        "{name} entered the fatal state"
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::StartFailed(format!(
                    "{name} did not reach Running within {}s",
                    self.config.start_timeout.as_secs()
                )));
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    fn record(operation: &str, result: &Result<InstanceInfo, GatewayError>) {
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::INSTANCE_OPERATIONS
            .with_label_values(&[operation, label])
            .inc();
    }

    pub async fn create(
        &self,
        port: u16,
        overrides: InstanceOverrides,
    ) -> Result<InstanceInfo, GatewayError> {
        let result = self.create_inner(port, overrides).await;
        Self::record("create", &result);
        result
    }

    async fn create_inner(
        &self,
        port: u16,
        overrides: InstanceOverrides,
    ) -> Result<InstanceInfo, GatewayError> {
        let _lock = PortLock::acquire(&self.config.lock_dir, port, self.config.lock_timeout).await?;
        let name = worker_name(port);

        if self.supervisor.get_process_info(&name).await?.is_some() {
            return Err(GatewayError::AlreadyExists(name));
        }
        if !Self::port_free_on_host(port) {
            return Err(GatewayError::PortInUse(port));
        }

        let merged = self.config.worker_defaults.merged_with(&overrides);
        std::fs::create_dir_all(&self.config.conf_dir)?;
        std::fs::create_dir_all(self.instance_dir(port))?;
        std::fs::create_dir_all(&self.config.log_dir)?;
        let conf_path = self.conf_path(port);
        std::fs::write(&conf_path, self.render_conf(port, &merged))?;

        let started = async {
            self.supervisor.reload().await?;
            self.supervisor.start_process(&name).await?;
            self.wait_for_running(&name).await
        }
        .await;

        match started {
            Ok(process) => {
                info!(port, "instance created");
                Ok(InstanceInfo::from_process(port, &process))
            }
            Err(e) => {
                // The config file must not outlive a failed start.
                if let Err(rm) = std::fs::remove_file(&conf_path) {
                    warn!(port, "failed to remove config after start failure: {rm}");
                }
                Err(e)
            }
        }
    }

    pub async fn update(
        &self,
        port: u16,
        overrides: InstanceOverrides,
    ) -> Result<InstanceInfo, GatewayError> {
        let result = self.update_inner(port, overrides).await;
        Self::record("update", &result);
        result
    }

    async fn update_inner(
        &self,
        port: u16,
        overrides: InstanceOverrides,
    ) -> Result<InstanceInfo, GatewayError> {
        let _lock = PortLock::acquire(&self.config.lock_dir, port, self.config.lock_timeout).await?;
        let name = worker_name(port);

        if self.supervisor.get_process_info(&name).await?.is_none() {
            return Err(GatewayError::InstanceNotFound(port));
        }

        if let Err(e) = self.supervisor.stop_process(&name).await {
            warn!(port, "stop before update failed (continuing): {e}");
        }
        if let Err(e) = self.supervisor.remove_process_group(&name).await {
            warn!(port, "remove before update failed (continuing): {e}");
        }

        let merged = self.config.worker_defaults.merged_with(&overrides);
        std::fs::write(self.conf_path(port), self.render_conf(port, &merged))?;

        self.supervisor.reload().await?;
        self.supervisor.start_process(&name).await?;
        let process = self.wait_for_running(&name).await?;

        info!(port, "instance updated");
        Ok(InstanceInfo::from_process(port, &process))
    }

    pub async fn delete(&self, port: u16) -> Result<(), GatewayError> {
        let result = self.delete_inner(port).await;
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::INSTANCE_OPERATIONS
            .with_label_values(&["delete", label])
            .inc();
        result
    }

    async fn delete_inner(&self, port: u16) -> Result<(), GatewayError> {
        let _lock = PortLock::acquire(&self.config.lock_dir, port, self.config.lock_timeout).await?;
        let name = worker_name(port);

        if self.supervisor.get_process_info(&name).await?.is_none() {
            return Err(GatewayError::InstanceNotFound(port));
        }

        if let Err(e) = self.supervisor.stop_process(&name).await {
            warn!(port, "stop during delete failed (continuing): {e}");
        }
        if let Err(e) = self.supervisor.remove_process_group(&name).await {
            warn!(port, "remove during delete failed (continuing): {e}");
        }

        // Storage and logs are best-effort.
        let instance_dir = self.instance_dir(port);
        if instance_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&instance_dir) {
                warn!(port, "failed to remove instance storage: {e}");
            }
        }
        for suffix in ["out", "err"] {
            let log = self.config.log_dir.join(format!("{name}.{suffix}"));
            if log.exists() {
                if let Err(e) = std::fs::remove_file(&log) {
                    warn!(port, "failed to remove log file: {e}");
                }
            }
        }

        // The declarative artifact goes last, and a failure here is fatal.
        let conf_path = self.conf_path(port);
        if conf_path.exists() {
            std::fs::remove_file(&conf_path)?;
        }
        if let Err(e) = self.supervisor.reload().await {
            warn!(port, "reload after delete failed: {e}");
        }

        info!(port, "instance deleted");
        Ok(())
    }

    pub async fn get(&self, port: u16) -> Result<InstanceInfo, GatewayError> {
        let name = worker_name(port);
        match self.supervisor.get_process_info(&name).await? {
            Some(process) => Ok(InstanceInfo::from_process(port, &process)),
            None => Err(GatewayError::InstanceNotFound(port)),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceInfo>, GatewayError> {
        let processes = self.supervisor.list_processes().await?;
        let mut instances: Vec<InstanceInfo> = processes
            .iter()
            .filter_map(|process| {
                parse_worker_port(&process.name)
                    .map(|port| InstanceInfo::from_process(port, process))
            })
            .collect();
        instances.sort_by_key(|instance| instance.port);

        let running = instances
            .iter()
            .filter(|instance| instance.state == ProcessState::Running)
            .count();
        metrics::INSTANCES_RUNNING.set(running as i64);

        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_names_roundtrip() {
        assert_eq!(worker_name(3001), "gowa_3001");
        assert_eq!(parse_worker_port("gowa_3001"), Some(3001));
        assert_eq!(parse_worker_port("nginx"), None);
        assert_eq!(parse_worker_port("gowa_abc"), None);
    }

    #[test]
    fn port_validation_bounds() {
        assert!(validate_port(1023).is_err());
        assert_eq!(validate_port(1024).unwrap(), 1024);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-1).is_err());
    }
}
