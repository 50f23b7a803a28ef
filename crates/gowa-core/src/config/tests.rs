use super::*;

#[test]
fn worker_defaults() {
    let config = WorkerConfig::default();
    assert_eq!(config.port, 3000);
    assert_eq!(config.os_name, "GOWA");
    assert!(config.chat_storage);
    assert!(config.account_validation);
    assert_eq!(config.webhook_secret, "secret");
    assert_eq!(config.reconnect_interval_secs, 30);
    assert_eq!(config.history_debounce_secs, 5);
    assert!(config.webhooks.is_empty());
}

#[test]
fn worker_config_from_toml() {
    let raw = r#"
        port = 3005
        debug = true
        webhooks = ["https://sink.example/hook"]
        webhook_secret = "s3cret"
        chat_storage = false
    "#;
    let config: WorkerConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.port, 3005);
    assert!(config.debug);
    assert_eq!(config.webhooks, vec!["https://sink.example/hook"]);
    assert_eq!(config.webhook_secret, "s3cret");
    assert!(!config.chat_storage);
    // Unspecified fields keep their defaults.
    assert_eq!(config.os_name, "GOWA");
}

#[test]
fn basic_auth_pairs_parsing() {
    let mut config = WorkerConfig::default();
    config.basic_auth = "admin:pass1, viewer:pass2".to_string();
    let pairs = config.basic_auth_pairs();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0], ("admin".to_string(), "pass1".to_string()));
    assert_eq!(pairs[1], ("viewer".to_string(), "pass2".to_string()));

    config.basic_auth = "malformed-entry".to_string();
    assert!(config.basic_auth_pairs().is_empty());
}

#[test]
fn chat_db_path_follows_toggle() {
    let mut config = WorkerConfig::default();
    assert!(config.chat_db_path().is_some());
    config.chat_storage = false;
    assert!(config.chat_db_path().is_none());
}

#[test]
fn overrides_overlay() {
    let defaults = InstanceOverrides {
        debug: Some(false),
        os: Some("GOWA".into()),
        webhook_secret: Some("default-secret".into()),
        ..Default::default()
    };
    let request = InstanceOverrides {
        debug: Some(true),
        webhook: Some("https://sink.example/hook".into()),
        ..Default::default()
    };
    let merged = defaults.merged_with(&request);
    assert_eq!(merged.debug, Some(true));
    assert_eq!(merged.os.as_deref(), Some("GOWA"));
    assert_eq!(merged.webhook_secret.as_deref(), Some("default-secret"));
    assert_eq!(merged.webhook.as_deref(), Some("https://sink.example/hook"));
}

#[test]
fn admin_token_is_mandatory() {
    // Env manipulation stays inside this single test to avoid races with
    // parallel tests.
    std::env::remove_var("ADMIN_TOKEN");
    assert!(AdminConfig::from_env().is_err());

    std::env::set_var("ADMIN_TOKEN", "super-secret");
    let config = AdminConfig::from_env().unwrap();
    assert_eq!(config.admin_token, "super-secret");
    assert_eq!(config.cleanup_retention_days, 7);
    assert_eq!(config.lock_timeout, Duration::from_secs(30));
    std::env::remove_var("ADMIN_TOKEN");
}

#[test]
fn expand_home_rewrites_tilde() {
    std::env::set_var("HOME", "/home/gowa");
    assert_eq!(expand_home("~/data"), "/home/gowa/data");
    assert_eq!(expand_home("/abs/path"), "/abs/path");
}
