//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use mqtt_bridge::config::{BridgeConfig, ConfigError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[client]
client_id = "sensor-gateway"
host = "broker.local"
port = 1884

[options]
keep_alive = 45
auto_reconnect = true
retry_count = 3
backoff_time = 250
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.client.client_id, "sensor-gateway");
    assert_eq!(config.client.host, "broker.local");
    assert_eq!(config.client.port, 1884);
    assert_eq!(config.options.keep_alive, Some(45));
    assert_eq!(config.options.retry_count, Some(3));
    assert_eq!(config.init_timeout(), Some(Duration::from_millis(10_000)));
}

#[test]
fn test_config_converts_to_client_config() {
    let temp_file = write_config(
        r#"
[client]
client_id = "gateway"
host = "broker.local"

[options]
enable_ssl = true
auto_reconnect = true
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    let client = config.to_client_config().unwrap();

    assert_eq!(client.client_id, "gateway");
    assert_eq!(client.port, 1883);
    assert!(client.options.ssl_enabled());
    assert_eq!(client.options.auto_reconnect, Some(true));
}

#[test]
fn test_config_resolves_credentials_from_environment() {
    std::env::set_var("MQTT_BRIDGE_LOADING_TEST_USER", "alice");
    std::env::set_var("MQTT_BRIDGE_LOADING_TEST_PASS", "s3cret");
    let temp_file = write_config(
        r#"
[client]
client_id = "gateway"
host = "broker.local"

[options]
username_env = "MQTT_BRIDGE_LOADING_TEST_USER"
password_env = "MQTT_BRIDGE_LOADING_TEST_PASS"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    let options = config.connection_options().unwrap();

    assert_eq!(options.username.as_deref(), Some("alice"));
    assert_eq!(options.password.as_deref(), Some("s3cret"));
}

#[test]
fn test_config_returns_error_when_client_section_missing() {
    let temp_file = write_config(
        r#"
[options]
auto_reconnect = true
"#,
    );

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let temp_file = write_config("[client\nclient_id = ");

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_missing_file() {
    let result = BridgeConfig::load_from_file(std::path::Path::new(
        "/nonexistent/mqtt-bridge-config.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_returns_error_for_invalid_client_id_with_special_chars() {
    let temp_file = write_config(
        r#"
[client]
client_id = "gateway with spaces!"
host = "broker.local"
"#,
    );

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_returns_error_for_empty_host() {
    let temp_file = write_config(
        r#"
[client]
client_id = "gateway"
host = ""
"#,
    );

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}
