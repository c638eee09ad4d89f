//! Test helpers and utilities for integration tests

use mqtt_bridge::client::{ClientConfig, ClientFactory, MqttClient};
use mqtt_bridge::protocol::ConnectionOptions;
use mqtt_bridge::router::EventRouter;
use mqtt_bridge::testing::MockNative;
use std::sync::Arc;

pub const CLIENT_ID: &str = "test-client";

/// A private router, a mock native layer emitting into it, and a factory
#[allow(dead_code)]
pub struct Harness {
    pub router: Arc<EventRouter>,
    pub native: Arc<MockNative>,
    pub factory: ClientFactory,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let router = Arc::new(EventRouter::new());
        Self::with_native(MockNative::new(Arc::clone(&router)), router)
    }

    pub fn with_native(native: MockNative, router: Arc<EventRouter>) -> Self {
        let native = Arc::new(native);
        let factory = ClientFactory::new(native.clone())
            .with_router(Arc::clone(&router))
            .with_jitter_seed(7);
        Self {
            router,
            native,
            factory,
        }
    }

    /// Create a client and fail the test if initialization does not succeed
    pub async fn client(&self, options: ConnectionOptions) -> MqttClient {
        self.factory
            .create(test_config(options))
            .await
            .expect("client should initialize")
    }

    /// Create, connect and acknowledge a client
    pub async fn connected_client(&self, options: ConnectionOptions) -> MqttClient {
        let client = self.client(options).await;
        client.connect();
        self.native.emit_connected(CLIENT_ID);
        client
    }
}

#[allow(dead_code)]
pub fn test_config(options: ConnectionOptions) -> ClientConfig {
    ClientConfig::new(CLIENT_ID, "broker.test", 1883).with_options(options)
}

/// Reconnect options with a small deterministic backoff (no jitter)
///
/// Attempt `n` waits `100ms * 2^n`.
#[allow(dead_code)]
pub fn fast_reconnect(retry_count: Option<u32>) -> ConnectionOptions {
    ConnectionOptions::default()
        .with_auto_reconnect(retry_count)
        .with_backoff(100, 60, 0)
}
