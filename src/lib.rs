//! MQTT Bridge - event-driven MQTT client facade
//!
//! A platform-independent client core on top of a fire-and-forget native
//! MQTT layer. Native operations are requests; their outcomes come back as
//! named events through an [`EventRouter`], and the [`MqttClient`] state
//! machine turns them into connection status, callbacks and automatic
//! reconnection with exponential backoff.
//!
//! # Overview
//!
//! - [`router`] - keyed listener registry with fault-isolated dispatch
//! - [`client`] - connection state machine, subscriptions, factory
//! - [`native`] - the native operation set and a rumqttc-backed adapter
//! - [`protocol`] - event names, payloads, options and reason codes
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_bridge::client::{ClientConfig, ClientFactory, SubscribeRequest};
//! use mqtt_bridge::native::RumqttcNative;
//! use mqtt_bridge::protocol::ConnectionOptions;
//! use mqtt_bridge::router::EventRouter;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let router = EventRouter::global();
//! let native = Arc::new(RumqttcNative::new(Arc::clone(&router))?);
//! let factory = ClientFactory::new(native).with_router(router);
//!
//! let config = ClientConfig::new("sensor-gateway", "localhost", 1883)
//!     .with_options(ConnectionOptions::default().with_auto_reconnect(Some(5)));
//! let client = factory.create(config).await.ok_or("initialization failed")?;
//!
//! client.set_on_connect_callback(|_| println!("connected"));
//! let _subscription = client.subscribe(SubscribeRequest::new("sensors/#", |message| {
//!     println!("{}: {}", message.topic, message.payload);
//! }));
//! client.connect();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod native;
pub mod observability;
pub mod protocol;
pub mod router;
pub mod testing;

pub use client::{
    create_client, ClientConfig, ClientFactory, DisconnectInfo, MqttClient, ReconnectInterceptor,
    SharedClient, SubscribeRequest, SubscriptionHandle,
};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, NativeError};
pub use native::NativeMqtt;
pub use protocol::*;
pub use router::{EventRouter, ListenerHandle};
