//! Gateway configuration.
//!
//! Explicit structs populated from the environment (and an optional TOML
//! file for the worker). Every recognized key is listed here; nothing is
//! bound by reflection.

mod defaults;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GatewayError;
use defaults::*;

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_u16(key: &str) -> Option<u16> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Per-worker configuration (one worker process serves one port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    /// Device OS name shown to paired phones.
    #[serde(default = "default_os_name")]
    pub os_name: String,
    /// Comma-separated `user:password` pairs; empty disables basic auth.
    #[serde(default)]
    pub basic_auth: String,
    #[serde(default = "default_true")]
    pub account_validation: bool,
    #[serde(default)]
    pub base_path: String,
    /// Automatic reply text for inbound individual messages.
    #[serde(default)]
    pub auto_reply: Option<String>,
    #[serde(default)]
    pub auto_mark_read: bool,
    /// Webhook subscriber URLs.
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret: String,
    /// Skip TLS verification on webhook deliveries. Insecure.
    #[serde(default)]
    pub webhook_insecure_skip_verify: bool,
    /// When non-empty, only these event names are delivered.
    #[serde(default)]
    pub webhook_events: Vec<String>,
    /// Chat storage toggle; disabled runs the store in memory.
    #[serde(default = "default_true")]
    pub chat_storage: bool,
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_statics_root")]
    pub statics_root: String,
    /// Auto-reconnect check interval in seconds.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// History-sync debounce window in seconds.
    #[serde(default = "default_history_debounce_secs")]
    pub history_debounce_secs: u64,
    /// LID resolver cache TTL in seconds.
    #[serde(default = "default_resolver_ttl_secs")]
    pub resolver_ttl_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            debug: false,
            os_name: default_os_name(),
            basic_auth: String::new(),
            account_validation: true,
            base_path: String::new(),
            auto_reply: None,
            auto_mark_read: false,
            webhooks: Vec::new(),
            webhook_secret: default_webhook_secret(),
            webhook_insecure_skip_verify: false,
            webhook_events: Vec::new(),
            chat_storage: true,
            storage_root: default_storage_root(),
            statics_root: default_statics_root(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            history_debounce_secs: default_history_debounce_secs(),
            resolver_ttl_secs: default_resolver_ttl_secs(),
        }
    }
}

impl WorkerConfig {
    /// Load an optional TOML file, then apply `GOWA_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|e| GatewayError::InvalidInput(format!("config file: {e}")))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_u16("GOWA_PORT") {
            self.port = v;
        }
        if let Some(v) = env_bool("GOWA_DEBUG") {
            self.debug = v;
        }
        if let Some(v) = env_string("GOWA_OS") {
            self.os_name = v;
        }
        if let Some(v) = env_string("GOWA_BASIC_AUTH") {
            self.basic_auth = v;
        }
        if let Some(v) = env_bool("GOWA_ACCOUNT_VALIDATION") {
            self.account_validation = v;
        }
        if let Some(v) = env_string("GOWA_BASE_PATH") {
            self.base_path = v;
        }
        if let Some(v) = env_string("GOWA_AUTO_REPLY") {
            self.auto_reply = Some(v);
        }
        if let Some(v) = env_bool("GOWA_AUTO_MARK_READ") {
            self.auto_mark_read = v;
        }
        if let Some(v) = env_list("GOWA_WEBHOOK") {
            self.webhooks = v;
        }
        if let Some(v) = env_string("GOWA_WEBHOOK_SECRET") {
            self.webhook_secret = v;
        }
        if let Some(v) = env_bool("GOWA_WEBHOOK_INSECURE_SKIP_VERIFY") {
            self.webhook_insecure_skip_verify = v;
        }
        if let Some(v) = env_list("GOWA_WEBHOOK_EVENTS") {
            self.webhook_events = v;
        }
        if let Some(v) = env_bool("GOWA_CHAT_STORAGE") {
            self.chat_storage = v;
        }
    }

    /// Parsed `user:password` pairs for worker basic auth.
    pub fn basic_auth_pairs(&self) -> Vec<(String, String)> {
        self.basic_auth
            .split(',')
            .filter_map(|pair| {
                let (user, pass) = pair.trim().split_once(':')?;
                Some((user.to_string(), pass.to_string()))
            })
            .collect()
    }

    /// Path to the session/auth database.
    pub fn session_db_path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.storage_root)).join("whatsapp.db")
    }

    /// Path to the chat storage database, or `None` when storage runs in
    /// memory.
    pub fn chat_db_path(&self) -> Option<PathBuf> {
        if self.chat_storage {
            Some(PathBuf::from(expand_home(&self.storage_root)).join("chatstorage.db"))
        } else {
            None
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn history_debounce(&self) -> Duration {
        Duration::from_secs(self.history_debounce_secs)
    }

    pub fn resolver_ttl(&self) -> Duration {
        Duration::from_secs(self.resolver_ttl_secs)
    }
}

/// Optional per-worker overrides carried in admin create/update requests
/// and overlaid onto the admin's worker defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_mark_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_storage: Option<bool>,
}

impl InstanceOverrides {
    /// Overlay `other` on top of `self`, returning the merged overrides.
    pub fn merged_with(&self, other: &InstanceOverrides) -> InstanceOverrides {
        InstanceOverrides {
            basic_auth: other.basic_auth.clone().or_else(|| self.basic_auth.clone()),
            debug: other.debug.or(self.debug),
            os: other.os.clone().or_else(|| self.os.clone()),
            account_validation: other.account_validation.or(self.account_validation),
            base_path: other.base_path.clone().or_else(|| self.base_path.clone()),
            auto_reply: other.auto_reply.clone().or_else(|| self.auto_reply.clone()),
            auto_mark_read: other.auto_mark_read.or(self.auto_mark_read),
            webhook: other.webhook.clone().or_else(|| self.webhook.clone()),
            webhook_secret: other
                .webhook_secret
                .clone()
                .or_else(|| self.webhook_secret.clone()),
            chat_storage: other.chat_storage.or(self.chat_storage),
        }
    }
}

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Bearer secret for the admin API. Mandatory; the control plane
    /// refuses to start without it.
    pub admin_token: String,
    pub admin_port: u16,
    pub supervisor_url: String,
    pub supervisor_user: Option<String>,
    pub supervisor_pass: Option<String>,
    pub conf_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub gowa_bin: String,
    /// Defaults applied to every worker unless overridden per instance.
    pub worker_defaults: InstanceOverrides,
    pub cleanup_retention_days: u64,
    pub cleanup_directories: Vec<String>,
    pub lock_timeout: Duration,
    pub start_timeout: Duration,
}

impl AdminConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        let admin_token = env_string("ADMIN_TOKEN").ok_or_else(|| {
            GatewayError::InvalidInput(
                "ADMIN_TOKEN is required; refusing to start the admin API without it".into(),
            )
        })?;

        let worker_defaults = InstanceOverrides {
            basic_auth: env_string("GOWA_BASIC_AUTH"),
            debug: env_bool("GOWA_DEBUG"),
            os: env_string("GOWA_OS"),
            account_validation: env_bool("GOWA_ACCOUNT_VALIDATION"),
            base_path: env_string("GOWA_BASE_PATH"),
            auto_reply: env_string("GOWA_AUTO_REPLY"),
            auto_mark_read: env_bool("GOWA_AUTO_MARK_READ"),
            webhook: env_string("GOWA_WEBHOOK"),
            webhook_secret: env_string("GOWA_WEBHOOK_SECRET"),
            chat_storage: env_bool("GOWA_CHAT_STORAGE"),
        };

        Ok(Self {
            admin_token,
            admin_port: env_u16("ADMIN_PORT").unwrap_or(default_admin_port()),
            supervisor_url: env_string("SUPERVISOR_URL")
                .unwrap_or_else(default_supervisor_url),
            supervisor_user: env_string("SUPERVISOR_USER"),
            supervisor_pass: env_string("SUPERVISOR_PASS"),
            conf_dir: PathBuf::from(
                env_string("SUPERVISOR_CONF_DIR").unwrap_or_else(default_conf_dir),
            ),
            instances_dir: PathBuf::from(
                env_string("INSTANCES_DIR").unwrap_or_else(default_instances_dir),
            ),
            log_dir: PathBuf::from(env_string("LOG_DIR").unwrap_or_else(default_log_dir)),
            lock_dir: PathBuf::from(env_string("LOCK_DIR").unwrap_or_else(default_lock_dir)),
            gowa_bin: env_string("GOWA_BIN").unwrap_or_else(default_gowa_bin),
            worker_defaults,
            cleanup_retention_days: env_u64("CLEANUP_RETENTION_DAYS")
                .unwrap_or(default_cleanup_retention_days()),
            cleanup_directories: env_list("CLEANUP_DIRECTORIES").unwrap_or_default(),
            lock_timeout: Duration::from_secs(default_lock_timeout_secs()),
            start_timeout: Duration::from_secs(default_start_timeout_secs()),
        })
    }
}
