//! Default values for configuration fields.

pub fn default_true() -> bool {
    true
}

pub fn default_port() -> u16 {
    3000
}

pub fn default_os_name() -> String {
    "GOWA".to_string()
}

pub fn default_webhook_secret() -> String {
    "secret".to_string()
}

pub fn default_storage_root() -> String {
    "storages".to_string()
}

pub fn default_statics_root() -> String {
    "statics".to_string()
}

pub fn default_reconnect_interval_secs() -> u64 {
    30
}

pub fn default_history_debounce_secs() -> u64 {
    5
}

pub fn default_resolver_ttl_secs() -> u64 {
    3600
}

pub fn default_admin_port() -> u16 {
    8088
}

pub fn default_supervisor_url() -> String {
    "http://127.0.0.1:9001/RPC2".to_string()
}

pub fn default_conf_dir() -> String {
    "/etc/supervisor/conf.d".to_string()
}

pub fn default_instances_dir() -> String {
    "instances".to_string()
}

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_lock_dir() -> String {
    "locks".to_string()
}

pub fn default_gowa_bin() -> String {
    "gowa".to_string()
}

pub fn default_cleanup_retention_days() -> u64 {
    7
}

pub fn default_lock_timeout_secs() -> u64 {
    30
}

pub fn default_start_timeout_secs() -> u64 {
    30
}
