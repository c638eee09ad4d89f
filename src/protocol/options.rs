//! Client identity, connection options and connection status
//!
//! These are the value types shared by the state machine, the factory and
//! the native layer. `ConnectionOptions` is a bag of optional fields so that a
//! `connect` override or a reconnect interceptor result can be merged
//! shallowly over the current options.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default MQTT keep alive in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 60;
/// Default base delay for reconnection backoff in milliseconds
pub const DEFAULT_BACKOFF_TIME_MS: u64 = 2000;
/// Default cap for reconnection backoff in seconds
pub const DEFAULT_MAX_BACKOFF_TIME_SECS: u64 = 60;
/// Default jitter bound in milliseconds
pub const DEFAULT_JITTER_MS: u64 = 1;

/// Identity of a logical connection inside the native client map
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub client_id: String,
    pub host: String,
    pub port: u16,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
        }
    }

    /// Broker address in `mqtt://host:port` form, used for logging
    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

/// Options for connecting and reconnecting a client
///
/// Every field is optional: `None` means "keep whatever is already set",
/// which is what makes [`ConnectionOptions::merge`] a shallow merge.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Keep alive interval in seconds (default 60)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<u16>,
    /// Start a clean session (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Build the native client with TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_ssl_config: Option<bool>,
    /// Reconnect with exponential backoff after an unexpected disconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    /// Maximum reconnection attempts per cycle (unset = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Base backoff delay in milliseconds (default 2000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_time: Option<u64>,
    /// Backoff cap in seconds (default 60)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_time: Option<u64>,
    /// Upper bound of the random jitter in milliseconds (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<u64>,
}

impl ConnectionOptions {
    /// Shallow merge: every field set in `overrides` replaces the current value
    pub fn merge(&mut self, overrides: ConnectionOptions) {
        let ConnectionOptions {
            keep_alive,
            clean_session,
            username,
            password,
            enable_ssl_config,
            auto_reconnect,
            retry_count,
            backoff_time,
            max_backoff_time,
            jitter,
        } = overrides;

        if keep_alive.is_some() {
            self.keep_alive = keep_alive;
        }
        if clean_session.is_some() {
            self.clean_session = clean_session;
        }
        if username.is_some() {
            self.username = username;
        }
        if password.is_some() {
            self.password = password;
        }
        if enable_ssl_config.is_some() {
            self.enable_ssl_config = enable_ssl_config;
        }
        if auto_reconnect.is_some() {
            self.auto_reconnect = auto_reconnect;
        }
        if retry_count.is_some() {
            self.retry_count = retry_count;
        }
        if backoff_time.is_some() {
            self.backoff_time = backoff_time;
        }
        if max_backoff_time.is_some() {
            self.max_backoff_time = max_backoff_time;
        }
        if jitter.is_some() {
            self.jitter = jitter;
        }
    }

    /// Consuming variant of [`merge`](Self::merge)
    pub fn merged(mut self, overrides: ConnectionOptions) -> Self {
        self.merge(overrides);
        self
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.auto_reconnect.unwrap_or(false)
    }

    pub fn ssl_enabled(&self) -> bool {
        self.enable_ssl_config.unwrap_or(false)
    }

    /// Parameters handed to the native `connect` operation
    pub fn native_connect_options(&self) -> NativeConnectOptions {
        NativeConnectOptions {
            keep_alive: self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            clean_session: self.clean_session.unwrap_or(true),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_auto_reconnect(mut self, retry_count: Option<u32>) -> Self {
        self.auto_reconnect = Some(true);
        self.retry_count = retry_count;
        self
    }

    pub fn with_backoff(mut self, backoff_time_ms: u64, max_backoff_time_secs: u64, jitter_ms: u64) -> Self {
        self.backoff_time = Some(backoff_time_ms);
        self.max_backoff_time = Some(max_backoff_time_secs);
        self.jitter = Some(jitter_ms);
        self
    }
}

// Credentials never reach the logs.
impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("enable_ssl_config", &self.enable_ssl_config)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("retry_count", &self.retry_count)
            .field("backoff_time", &self.backoff_time)
            .field("max_backoff_time", &self.max_backoff_time)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Effective parameters of a native connect call
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeConnectOptions {
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: String,
    pub password: String,
}

impl Default for NativeConnectOptions {
    fn default() -> Self {
        ConnectionOptions::default().native_connect_options()
    }
}

impl fmt::Debug for NativeConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeConnectOptions")
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection status of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" => Ok(ConnectionStatus::Connected),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(format!("unknown connection status: {other}")),
        }
    }
}

/// MQTT quality of service level
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.as_u8()
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_shallow() {
        let mut options = ConnectionOptions {
            keep_alive: Some(30),
            username: Some("alice".to_string()),
            auto_reconnect: Some(true),
            retry_count: Some(3),
            ..Default::default()
        };

        options.merge(ConnectionOptions {
            password: Some("token-2".to_string()),
            retry_count: Some(5),
            ..Default::default()
        });

        assert_eq!(options.keep_alive, Some(30));
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.password.as_deref(), Some("token-2"));
        assert_eq!(options.retry_count, Some(5));
        assert!(options.auto_reconnect_enabled());
    }

    #[test]
    fn test_native_connect_defaults() {
        let params = ConnectionOptions::default().native_connect_options();
        assert_eq!(params.keep_alive, 60);
        assert!(params.clean_session);
        assert_eq!(params.username, "");
        assert_eq!(params.password, "");
    }

    #[test]
    fn test_clean_session_false_is_respected() {
        let options = ConnectionOptions {
            clean_session: Some(false),
            ..Default::default()
        };
        assert!(!options.native_connect_options().clean_session);
    }

    #[test]
    fn test_debug_redacts_password() {
        let options = ConnectionOptions::default().with_credentials("bob", "hunter2");
        let rendered = format!("{options:?}");
        assert!(rendered.contains("bob"));
        assert!(!rendered.contains("hunter2"));

        let native = options.native_connect_options();
        assert!(!format!("{native:?}").contains("hunter2"));
    }

    #[test]
    fn test_connection_status_round_trip_through_str() {
        for status in [
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>(), Ok(status));
        }
        assert!("reconnecting".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(Qos::try_from(0), Ok(Qos::AtMostOnce));
        assert_eq!(Qos::try_from(2), Ok(Qos::ExactlyOnce));
        assert!(Qos::try_from(3).is_err());
        assert_eq!(u8::from(Qos::AtLeastOnce), 1);
        assert_eq!(Qos::default(), Qos::AtLeastOnce);
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"keepAlive": 15, "autoReconnect": true, "retryCount": 2, "maxBackoffTime": 10}"#,
        )
        .unwrap();
        assert_eq!(options.keep_alive, Some(15));
        assert_eq!(options.retry_count, Some(2));
        assert_eq!(options.max_backoff_time, Some(10));
        assert!(options.auto_reconnect_enabled());
    }
}
