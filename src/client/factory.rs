//! Client factory
//!
//! Creating a client asks the native layer to construct its side and then
//! waits for the `{clientId}client_initialize` event. A failed or timed out
//! initialization yields `None`, never an error.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn, Instrument};

use super::mqtt_client::MqttClient;
use super::reconnect::BackoffCalculator;
use crate::client_span;
use crate::error::BridgeError;
use crate::native::NativeMqtt;
use crate::observability::metrics;
use crate::protocol::{ClientIdentity, ClientInitializeEvent, ConnectionOptions, EventKey, EventKind};
use crate::router::EventRouter;

/// Default time to wait for `client_initialize`
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Everything needed to create one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.client_id.clone(), self.host.clone(), self.port)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum InitOutcome {
    Ready,
    Rejected,
    TimedOut,
    Abandoned,
}

/// Creates [`MqttClient`]s bound to one native layer and one router
///
/// The native implementation must emit its events into the same router.
#[derive(Clone)]
pub struct ClientFactory {
    native: Arc<dyn NativeMqtt>,
    router: Arc<EventRouter>,
    init_timeout: Option<Duration>,
    jitter_seed: Option<u64>,
}

impl ClientFactory {
    /// Factory on the process-wide router with the default init timeout
    pub fn new(native: Arc<dyn NativeMqtt>) -> Self {
        Self {
            native,
            router: EventRouter::global(),
            init_timeout: Some(DEFAULT_INIT_TIMEOUT),
            jitter_seed: None,
        }
    }

    pub fn with_router(mut self, router: Arc<EventRouter>) -> Self {
        self.router = router;
        self
    }

    /// `None` waits for `client_initialize` indefinitely
    pub fn with_init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Make backoff jitter reproducible
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn native(&self) -> &Arc<dyn NativeMqtt> {
        &self.native
    }

    /// Create a client; `None` on missing host or failed initialization
    pub async fn create(&self, config: ClientConfig) -> Option<MqttClient> {
        let span = client_span!(client_id = %config.client_id, host = %config.host, port = config.port);
        self.create_inner(config).instrument(span).await
    }

    async fn create_inner(&self, config: ClientConfig) -> Option<MqttClient> {
        if config.host.trim().is_empty() {
            warn!("Refusing to create an MQTT client without a host");
            metrics().client_init_failed();
            return None;
        }

        let identity = config.identity();
        let (sender, receiver) = oneshot::channel::<bool>();
        let sender = Mutex::new(Some(sender));
        let init_listener = self.router.add_listener(
            &EventKey::client(&identity.client_id, EventKind::ClientInitialize),
            move |payload| {
                let initialized = payload
                    .decode::<ClientInitializeEvent>()
                    .map(|event| event.client_init)
                    .unwrap_or(false);
                if let Some(sender) = sender.lock().take() {
                    let _ = sender.send(initialized);
                }
            },
        );

        let backoff = match self.jitter_seed {
            Some(seed) => BackoffCalculator::seeded(seed),
            None => BackoffCalculator::from_entropy(),
        };
        let client = MqttClient::new(
            identity.clone(),
            config.options.clone(),
            Arc::clone(&self.native),
            Arc::clone(&self.router),
            backoff,
        );
        client.attach_lifecycle();

        if let Err(e) = self.native.create_mqtt(
            &identity.client_id,
            &identity.host,
            identity.port,
            config.options.ssl_enabled(),
        ) {
            error!(error = %e, "Native client construction failed");
            init_listener.remove();
            client.detach_lifecycle();
            metrics().client_init_failed();
            return None;
        }

        let outcome = match self.init_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(result) => Self::classify(result),
                Err(_) => InitOutcome::TimedOut,
            },
            None => Self::classify(receiver.await),
        };
        init_listener.remove();

        match outcome {
            InitOutcome::Ready => {
                metrics().client_created();
                info!(broker = %identity.broker_url(), "MQTT client initialized");
                Some(client)
            }
            other => {
                let error = BridgeError::initialization_failed(&identity.client_id);
                warn!(outcome = ?other, error = %error, "MQTT client initialization failed");
                client.detach_lifecycle();
                metrics().client_init_failed();
                None
            }
        }
    }

    fn classify(result: Result<bool, oneshot::error::RecvError>) -> InitOutcome {
        match result {
            Ok(true) => InitOutcome::Ready,
            Ok(false) => InitOutcome::Rejected,
            Err(_) => InitOutcome::Abandoned,
        }
    }
}

/// Create a client on the process-wide router
///
/// `native` must emit into [`EventRouter::global`].
pub async fn create_client(config: ClientConfig, native: Arc<dyn NativeMqtt>) -> Option<MqttClient> {
    ClientFactory::new(native).create(config).await
}
