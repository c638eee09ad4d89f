//! TOML configuration for the bridge binary
//!
//! ```toml
//! [client]
//! client_id = "sensor-gateway"
//! host = "broker.local"
//! port = 1883
//!
//! [options]
//! auto_reconnect = true
//! retry_count = 5
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//!
//! [factory]
//! init_timeout_ms = 10000
//! ```
//!
//! Credentials are never stored in the file, only the names of the
//! environment variables holding them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::client::ClientConfig;
use crate::protocol::ConnectionOptions;

/// Complete configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub client: ClientSection,
    #[serde(default)]
    pub options: OptionsSection,
    #[serde(default)]
    pub factory: FactorySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identifier (must match [a-zA-Z0-9._-]+)
    pub client_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    1883
}

/// Connection options as written in the file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptionsSection {
    pub keep_alive: Option<u16>,
    pub clean_session: Option<bool>,
    pub enable_ssl: Option<bool>,
    pub auto_reconnect: Option<bool>,
    pub retry_count: Option<u32>,
    /// Base backoff in milliseconds
    pub backoff_time: Option<u64>,
    /// Backoff cap in seconds
    pub max_backoff_time: Option<u64>,
    /// Jitter bound in milliseconds
    pub jitter: Option<u64>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorySection {
    /// Wait for client initialization; 0 waits forever
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

fn default_init_timeout_ms() -> u64 {
    10_000
}

impl Default for FactorySection {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a single client given on the command line
    pub fn for_broker(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client: ClientSection {
                client_id: client_id.into(),
                host: host.into(),
                port,
            },
            options: OptionsSection::default(),
            factory: FactorySection::default(),
        }
    }

    /// Configuration from an `mqtt://` or `mqtts://` broker URL
    ///
    /// `mqtts` enables TLS and defaults the port to 8883.
    pub fn from_broker_url(client_id: impl Into<String>, broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|e| ConfigError::InvalidConfig(format!("invalid broker URL '{broker_url}': {e}")))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "unsupported broker URL scheme '{other}'"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidConfig(format!("broker URL '{broker_url}' has no host")))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        let mut config = Self::for_broker(client_id, host, port);
        if tls {
            config.options.enable_ssl = Some(true);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client.client_id)?;

        if self.client.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[client] host must not be empty".to_string(),
            ));
        }
        if self.client.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "[client] port must be non-zero".to_string(),
            ));
        }
        if self.options.max_backoff_time == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "[options] max_backoff_time must be greater than zero".to_string(),
            ));
        }
        if self.options.retry_count.is_some() && self.options.auto_reconnect != Some(true) {
            tracing::warn!("retry_count is set but auto_reconnect is not enabled");
        }

        Ok(())
    }

    /// `None` when initialization may wait indefinitely
    pub fn init_timeout(&self) -> Option<Duration> {
        match self.factory.init_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Connection options with credentials resolved from the environment
    pub fn connection_options(&self) -> Result<ConnectionOptions, ConfigError> {
        let section = &self.options;
        Ok(ConnectionOptions {
            keep_alive: section.keep_alive,
            clean_session: section.clean_session,
            username: Self::get_env_var_optional(section.username_env.as_deref())?,
            password: Self::get_env_var_optional(section.password_env.as_deref())?,
            enable_ssl_config: section.enable_ssl,
            auto_reconnect: section.auto_reconnect,
            retry_count: section.retry_count,
            backoff_time: section.backoff_time,
            max_backoff_time: section.max_backoff_time,
            jitter: section.jitter,
        })
    }

    pub fn to_client_config(&self) -> Result<ClientConfig, ConfigError> {
        Ok(ClientConfig::new(
            self.client.client_id.clone(),
            self.client.host.clone(),
            self.client.port,
        )
        .with_options(self.connection_options()?))
    }

    /// A named variable that is missing is an error; no name means no value
    fn get_env_var_optional(name: Option<&str>) -> Result<Option<String>, ConfigError> {
        match name {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.to_string())),
            None => Ok(None),
        }
    }
}

/// Validate client ID format
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[client]
client_id = "gateway-1"
host = "broker.local"
port = 8883

[options]
keep_alive = 30
clean_session = false
enable_ssl = true
auto_reconnect = true
retry_count = 5
backoff_time = 500
max_backoff_time = 30
jitter = 100

[factory]
init_timeout_ms = 2500
"#;

        let config = BridgeConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.client.client_id, "gateway-1");
        assert_eq!(config.client.port, 8883);
        assert_eq!(config.init_timeout(), Some(Duration::from_millis(2500)));

        let options = config.connection_options().unwrap();
        assert_eq!(options.keep_alive, Some(30));
        assert_eq!(options.enable_ssl_config, Some(true));
        assert_eq!(options.retry_count, Some(5));
        assert_eq!(options.username, None);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
[client]
client_id = "minimal"
host = "localhost"
"#,
        )
        .unwrap();

        assert_eq!(config.client.port, 1883);
        assert_eq!(config.options, OptionsSection::default());
        assert_eq!(config.init_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_init_timeout_waits_forever() {
        let mut config = BridgeConfig::for_broker("c1", "localhost", 1883);
        config.factory.init_timeout_ms = 0;
        assert_eq!(config.init_timeout(), None);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("invalid@client").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("valid-client_123.test").is_ok());
    }

    #[test]
    fn test_invalid_port_and_backoff_rejected() {
        let mut config = BridgeConfig::for_broker("c1", "localhost", 0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        config.client.port = 1883;
        config.options.max_backoff_time = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_broker_url_parsing() {
        let plain = BridgeConfig::from_broker_url("c1", "mqtt://broker.local").unwrap();
        assert_eq!(plain.client.host, "broker.local");
        assert_eq!(plain.client.port, 1883);
        assert_eq!(plain.options.enable_ssl, None);

        let tls = BridgeConfig::from_broker_url("c1", "mqtts://broker.local").unwrap();
        assert_eq!(tls.client.port, 8883);
        assert_eq!(tls.options.enable_ssl, Some(true));

        let explicit = BridgeConfig::from_broker_url("c1", "mqtt://10.0.0.5:1884").unwrap();
        assert_eq!(explicit.client.host, "10.0.0.5");
        assert_eq!(explicit.client.port, 1884);

        assert!(BridgeConfig::from_broker_url("c1", "http://broker.local").is_err());
        assert!(BridgeConfig::from_broker_url("c1", "not a url").is_err());
    }

    #[test]
    fn test_missing_credential_variable_is_reported() {
        let mut config = BridgeConfig::for_broker("c1", "localhost", 1883);
        config.options.username_env = Some("MQTT_BRIDGE_TEST_UNSET_USERNAME".to_string());

        let result = config.to_client_config();
        assert!(
            matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "MQTT_BRIDGE_TEST_UNSET_USERNAME")
        );
    }
}
