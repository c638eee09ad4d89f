//! Application-level singleton wrapper
//!
//! [`SharedClient`] keeps at most one [`MqttClient`] for an application.
//! Callbacks registered before the client exists are queued and attached as
//! soon as `initialize` produces an instance.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

use super::factory::{ClientConfig, ClientFactory};
use super::mqtt_client::{DisconnectInfo, MqttClient};
use super::subscription::{SubscribeRequest, SubscriptionHandle};
use crate::protocol::{ConnectedEvent, ConnectionOptions, ConnectionStatus, MqttErrorEvent, ReasonCode};
use crate::router::ListenerHandle;

#[derive(Clone)]
enum Callback {
    Connect(Arc<dyn Fn(&ConnectedEvent) + Send + Sync>),
    ConnectFailure(Arc<dyn Fn(ReasonCode) + Send + Sync>),
    Disconnect(Arc<dyn Fn(ReasonCode, &DisconnectInfo) + Send + Sync>),
    Error(Arc<dyn Fn(&MqttErrorEvent) + Send + Sync>),
}

impl Callback {
    fn attach(&self, client: &MqttClient) -> ListenerHandle {
        match self.clone() {
            Callback::Connect(cb) => client.set_on_connect_callback(move |ack| cb(ack)),
            Callback::ConnectFailure(cb) => {
                client.set_on_connect_failure_callback(move |code| cb(code))
            }
            Callback::Disconnect(cb) => {
                client.set_on_disconnect_callback(move |code, info| cb(code, info))
            }
            Callback::Error(cb) => client.set_on_error_callback(move |event| cb(event)),
        }
    }
}

enum Registration {
    Queued(Callback),
    Attached(ListenerHandle),
}

#[derive(Default)]
struct SharedState {
    client: Option<MqttClient>,
    config: Option<ClientConfig>,
    registrations: BTreeMap<u64, Registration>,
}

struct SharedInner {
    factory: ClientFactory,
    init_lock: tokio::sync::Mutex<()>,
    state: Mutex<SharedState>,
    next_id: AtomicU64,
}

/// One lazily created client shared across an application
#[derive(Clone)]
pub struct SharedClient {
    inner: Arc<SharedInner>,
}

impl SharedClient {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                factory,
                init_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(SharedState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create the client unless one already exists for this exact config
    ///
    /// Returns the current instance. Concurrent calls are serialized.
    pub async fn initialize(&self, config: ClientConfig) -> Option<MqttClient> {
        let _guard = self.inner.init_lock.lock().await;

        let previous = {
            let mut state = self.inner.state.lock();
            if state.client.is_some() && state.config.as_ref() == Some(&config) {
                return state.client.clone();
            }
            state.config = Some(config.clone());
            state.client.take()
        };
        if let Some(previous) = previous {
            info!(client_id = %previous.client_id(), "Replacing shared MQTT client");
            previous.remove();
        }

        let client = self.inner.factory.create(config).await?;

        let mut state = self.inner.state.lock();
        for registration in state.registrations.values_mut() {
            if let Registration::Queued(callback) = registration {
                let attached = callback.attach(&client);
                *registration = Registration::Attached(attached);
            }
        }
        state.client = Some(client.clone());
        Some(client)
    }

    pub fn client(&self) -> Option<MqttClient> {
        self.inner.state.lock().client.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().client.is_some()
    }

    pub fn connect(&self, overrides: Option<ConnectionOptions>) {
        match self.client() {
            Some(client) => client.connect_with(overrides),
            None => warn!("MQTT client is not initialized"),
        }
    }

    pub fn disconnect(&self) {
        match self.client() {
            Some(client) => client.disconnect(),
            None => warn!("MQTT client is not initialized"),
        }
    }

    /// Remove the client and forget it together with its config
    pub fn remove(&self) {
        let client = {
            let mut state = self.inner.state.lock();
            state.config = None;
            state.client.take()
        };
        match client {
            Some(client) => client.remove(),
            None => warn!("MQTT client is not initialized"),
        }
    }

    pub fn subscribe(&self, request: SubscribeRequest) -> Option<SubscriptionHandle> {
        match self.client() {
            Some(client) => Some(client.subscribe(request)),
            None => {
                warn!(topic = %request.topic, "MQTT client is not initialized");
                None
            }
        }
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self.client() {
            Some(client) => Some(client.connection_status()),
            None => {
                warn!("MQTT client is not initialized");
                None
            }
        }
    }

    pub fn on_connect<F>(&self, callback: F) -> SharedCallbackHandle
    where
        F: Fn(&ConnectedEvent) + Send + Sync + 'static,
    {
        self.register(Callback::Connect(Arc::new(callback)))
    }

    pub fn on_connect_failure<F>(&self, callback: F) -> SharedCallbackHandle
    where
        F: Fn(ReasonCode) + Send + Sync + 'static,
    {
        self.register(Callback::ConnectFailure(Arc::new(callback)))
    }

    pub fn on_disconnect<F>(&self, callback: F) -> SharedCallbackHandle
    where
        F: Fn(ReasonCode, &DisconnectInfo) + Send + Sync + 'static,
    {
        self.register(Callback::Disconnect(Arc::new(callback)))
    }

    pub fn on_error<F>(&self, callback: F) -> SharedCallbackHandle
    where
        F: Fn(&MqttErrorEvent) + Send + Sync + 'static,
    {
        self.register(Callback::Error(Arc::new(callback)))
    }

    /// Callbacks still waiting for an instance
    pub fn pending_callbacks(&self) -> usize {
        self.inner
            .state
            .lock()
            .registrations
            .values()
            .filter(|r| matches!(r, Registration::Queued(_)))
            .count()
    }

    fn register(&self, callback: Callback) -> SharedCallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        let registration = match &state.client {
            Some(client) => Registration::Attached(callback.attach(client)),
            None => Registration::Queued(callback),
        };
        state.registrations.insert(id, registration);

        SharedCallbackHandle {
            id,
            shared: Arc::downgrade(&self.inner),
        }
    }
}

/// Handle of a callback registered through [`SharedClient`]
///
/// Removes the callback whether it is still queued or already attached.
#[derive(Debug)]
pub struct SharedCallbackHandle {
    id: u64,
    shared: Weak<SharedInner>,
}

impl SharedCallbackHandle {
    pub fn remove(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let registration = shared.state.lock().registrations.remove(&self.id);
        if let Some(Registration::Attached(handle)) = registration {
            handle.remove();
        }
    }
}
