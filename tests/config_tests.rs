// ABOUTME: Tests for configuration loading and validation
// ABOUTME: Verifies TOML parsing, env var overrides, and required field validation

use serial_test::serial;
use std::io::Write;

/// Helper to clear all config-related env vars
fn clear_config_env_vars() {
    std::env::remove_var("CHIRP_CONFIG_PATH");
    std::env::remove_var("GATEWAY_URL");
    std::env::remove_var("GATEWAY_TOKEN");
    std::env::remove_var("APPLICATION_ID");
    std::env::remove_var("GUILD_ID");
    std::env::remove_var("WEBHOOK_URL");
    std::env::remove_var("WEBHOOK_TOKEN");
    std::env::remove_var("FINGERPRINT_PATH");
    std::env::remove_var("ENABLED_EXTENSIONS");
}

fn write_config(dir: &std::path::Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    config_path
}

#[test]
#[serial]
fn test_config_loads_from_toml_file() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
url = "wss://gateway.test.chat/ws"
token = "secret123"
application_id = 42
guild_id = 77
heartbeat_secs = 15

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
queue_capacity = 32

[extensions]
enabled = ["about"]
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());

    let config = chirp::config::Config::load().unwrap();

    assert_eq!(config.gateway.url, "wss://gateway.test.chat/ws");
    assert_eq!(config.gateway.token, "secret123");
    assert_eq!(config.gateway.application_id, 42);
    assert_eq!(config.gateway.guild_id, 77);
    assert_eq!(config.gateway.heartbeat_secs, 15);
    assert_eq!(config.webhook.url, "https://hooks.test.chat/logs");
    assert_eq!(config.webhook.queue_capacity, 32);
    assert_eq!(config.extensions.enabled, vec!["about".to_string()]);

    // Unspecified fields keep their defaults
    assert_eq!(config.webhook.batch_size, 16);
    assert_eq!(config.gateway.reconnect_max_retries, 10);
    assert!(config.gateway.shard.is_none());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_env_var_overrides() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
token = "from-file"
application_id = 1
guild_id = 1

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());
    std::env::set_var("GATEWAY_TOKEN", "from-env");
    std::env::set_var("GUILD_ID", "999");
    std::env::set_var("ENABLED_EXTENSIONS", "audit, about");

    let config = chirp::config::Config::load().unwrap();

    assert_eq!(config.gateway.token, "from-env");
    assert_eq!(config.gateway.guild_id, 999);
    assert_eq!(config.gateway.application_id, 1);
    assert_eq!(
        config.extensions.enabled,
        vec!["audit".to_string(), "about".to_string()]
    );

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_requires_gateway_token() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
application_id = 1
guild_id = 1

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());

    let err = chirp::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("gateway.token"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_requires_webhook_url() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
token = "secret"
application_id = 1
guild_id = 1

[webhook]
token = "hook-secret"
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());

    let err = chirp::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("webhook.url"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_rejects_invalid_shard() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
token = "secret"
application_id = 1
guild_id = 1
shard = [2, 2]

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());

    let err = chirp::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("shard"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_rejects_non_numeric_application_id() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
token = "secret"
guild_id = 1

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());
    std::env::set_var("APPLICATION_ID", "not-a-number");

    let err = chirp::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("APPLICATION_ID"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_rejects_zero_queue_capacity() {
    clear_config_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();

    let config_path = write_config(
        temp_dir.path(),
        r#"
[gateway]
token = "secret"
application_id = 1
guild_id = 1

[webhook]
url = "https://hooks.test.chat/logs"
token = "hook-secret"
queue_capacity = 0
"#,
    );
    std::env::set_var("CHIRP_CONFIG_PATH", config_path.to_str().unwrap());

    let err = chirp::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("queue_capacity"));

    clear_config_env_vars();
}
