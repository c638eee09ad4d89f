//! Event naming and payloads exchanged with the native layer
//!
//! Internally every event is addressed by a structured [`EventKey`]
//! (scope + kind). The flat string form (`{scope}{suffix}`) only exists at the
//! native boundary, where the platform layer emits notifications by name.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::options::Qos;

/// Numeric reason code attached to connect/disconnect/subscribe outcomes
///
/// Non-negative values are protocol acknowledgment codes and are treated as
/// opaque. Negative values are failures raised by the native layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasonCode(pub i32);

impl ReasonCode {
    pub const NORMAL_DISCONNECTION: ReasonCode = ReasonCode(0);
    pub const BAD_USER_NAME_OR_PASSWORD: ReasonCode = ReasonCode(134);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(135);
    pub const BAD_AUTHENTICATION_METHOD: ReasonCode = ReasonCode(140);
    pub const DEFAULT: ReasonCode = ReasonCode(-1);
    pub const CONNECTION_ERROR: ReasonCode = ReasonCode(-2);
    pub const DISCONNECTION_ERROR: ReasonCode = ReasonCode(-3);
    pub const SUBSCRIPTION_ERROR: ReasonCode = ReasonCode(-4);
    pub const UNSUBSCRIPTION_ERROR: ReasonCode = ReasonCode(-5);
    pub const INITIALIZATION_ERROR: ReasonCode = ReasonCode(-6);
    pub const RX_CHAIN_ERROR: ReasonCode = ReasonCode(-7);

    pub fn code(self) -> i32 {
        self.0
    }

    /// True for the negative codes produced by the native layer
    pub fn is_internal(self) -> bool {
        self.0 < 0
    }
}

impl Default for ReasonCode {
    fn default() -> Self {
        ReasonCode::DEFAULT
    }
}

impl From<i32> for ReasonCode {
    fn from(code: i32) -> Self {
        ReasonCode(code)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one `subscribe` call
///
/// Unique per call, so the same topic/QoS pair subscribed twice yields two
/// distinct ids. Also used as the event scope for that subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// `mqtt_client#{client_id}#subscribe_mqtt#{topic}#{qos}#{tag}`
    pub fn generate(client_id: &str, topic: &str, qos: Qos, tag: u64) -> Self {
        Self(format!(
            "mqtt_client#{client_id}#subscribe_mqtt#{topic}#{}#{tag}",
            qos.as_u8()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriptionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Purpose of an event; serializes to the fixed suffix of the event name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ClientInitialize,
    Connected,
    Disconnected,
    MqttError,
    /// Raw message delivery for a subscription (empty suffix)
    Message,
    SubscribeSuccess,
    SubscribeFailed,
}

impl EventKind {
    pub fn suffix(self) -> &'static str {
        match self {
            EventKind::ClientInitialize => "client_initialize",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::MqttError => "mqtt_error",
            EventKind::Message => "",
            EventKind::SubscribeSuccess => "subscribe_success",
            EventKind::SubscribeFailed => "subscribe_failed",
        }
    }

    /// Kinds scoped by a client id
    pub const CLIENT_KINDS: [EventKind; 4] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::ClientInitialize,
        EventKind::MqttError,
    ];

    /// Kinds scoped by a subscription id
    pub const SUBSCRIPTION_KINDS: [EventKind; 3] = [
        EventKind::Message,
        EventKind::SubscribeSuccess,
        EventKind::SubscribeFailed,
    ];
}

/// Owner of an event name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventScope {
    Client(String),
    Subscription(SubscriptionId),
}

impl EventScope {
    pub fn as_str(&self) -> &str {
        match self {
            EventScope::Client(client_id) => client_id,
            EventScope::Subscription(id) => id.as_str(),
        }
    }
}

/// Structured routing key: scope plus kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub scope: EventScope,
    pub kind: EventKind,
}

impl EventKey {
    pub fn client(client_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            scope: EventScope::Client(client_id.into()),
            kind,
        }
    }

    pub fn subscription(id: &SubscriptionId, kind: EventKind) -> Self {
        Self {
            scope: EventScope::Subscription(id.clone()),
            kind,
        }
    }

    /// Flat event name as used by the native event transport
    pub fn event_name(&self) -> String {
        format!("{}{}", self.scope.as_str(), self.kind.suffix())
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scope.as_str(), self.kind.suffix())
    }
}

/// Flat key/value payload of a native notification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(Map<String, Value>);

impl EventPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; anything but an object yields an empty payload
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// Serialize a typed payload into its flat form
    pub fn from_typed<T: Serialize>(typed: &T) -> Self {
        serde_json::to_value(typed)
            .map(Self::from_value)
            .unwrap_or_default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode into one of the typed payloads below
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for EventPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// `{clientId}client_initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInitializeEvent {
    #[serde(default)]
    pub client_init: bool,
}

/// `{clientId}connected`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedEvent {
    #[serde(default)]
    pub reason_code: ReasonCode,
}

/// `{clientId}disconnected`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedEvent {
    #[serde(default)]
    pub reason_code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `{clientId}mqtt_error`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttErrorEvent {
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub reason_code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_disconnected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_subscribed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_unsubscribed: Option<bool>,
}

/// `{subscriptionId}`: one message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub payload: String,
    pub topic: String,
    pub qos: Qos,
}

/// `{subscriptionId}subscribe_success`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeSuccessEvent {
    #[serde(default)]
    pub message: String,
    pub topic: String,
    pub qos: Qos,
}

/// `{subscriptionId}subscribe_failed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeFailedEvent {
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
}
