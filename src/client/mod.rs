//! Client side of the bridge
//!
//! - [`reconnect`] - backoff calculation and retry decisions
//! - [`state`] - connection status transitions
//! - [`subscription`] - subscription registry and handles
//! - [`mqtt_client`] - the connection state machine
//! - [`factory`] - client construction
//! - [`shared`] - optional application-wide singleton

pub mod factory;
pub mod mqtt_client;
pub mod reconnect;
pub mod shared;
pub mod state;
pub mod subscription;

pub use factory::{create_client, ClientConfig, ClientFactory, DEFAULT_INIT_TIMEOUT};
pub use mqtt_client::{DisconnectInfo, InterceptorHandle, MqttClient, ReconnectInterceptor};
pub use reconnect::{compute_backoff, BackoffCalculator, ReconnectPolicy, ReconnectionDecision};
pub use shared::{SharedCallbackHandle, SharedClient};
pub use state::DisconnectType;
pub use subscription::{SubscribeRequest, SubscriptionHandle};
