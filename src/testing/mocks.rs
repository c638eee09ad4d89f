//! Mock implementations for testing
//!
//! [`MockNative`] records every native call and lets a test play the
//! native side by emitting events into the same router the clients listen
//! on. No broker or runtime is required.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::native::{NativeError, NativeMqtt, NativeOperation, NativeResult};
use crate::protocol::{
    ClientInitializeEvent, ConnectedEvent, ConnectionStatus, DisconnectedEvent, EventKey,
    EventKind, EventPayload, MessageEvent, MqttErrorEvent, NativeConnectOptions, Qos, ReasonCode,
    SubscribeFailedEvent, SubscribeSuccessEvent, SubscriptionId,
};
use crate::router::EventRouter;

/// One recorded native call
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    Create {
        client_id: String,
        host: String,
        port: u16,
        enable_ssl: bool,
    },
    Remove {
        client_id: String,
    },
    Connect {
        client_id: String,
        options: NativeConnectOptions,
    },
    Disconnect {
        client_id: String,
    },
    Subscribe {
        subscription_id: SubscriptionId,
        client_id: String,
        topic: String,
        qos: Qos,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
        client_id: String,
        topic: String,
    },
}

/// What the mock does when asked to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Record the call only; the test emits the outcome
    #[default]
    Manual,
    /// Emit `connected` immediately
    Accept,
    /// Emit `disconnected` with this reason immediately
    Refuse(ReasonCode),
}

#[derive(Debug)]
struct MockState {
    calls: Vec<NativeCall>,
    /// `None` never answers `create_mqtt`
    init_response: Option<bool>,
    connect_behavior: ConnectBehavior,
    failing: Vec<NativeOperation>,
    statuses: HashMap<String, ConnectionStatus>,
    /// `(client id, topic) -> subscription ids`
    topics: HashMap<(String, String), BTreeSet<SubscriptionId>>,
    broker_subscribed: Vec<String>,
    broker_unsubscribed: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            init_response: Some(true),
            connect_behavior: ConnectBehavior::default(),
            failing: Vec::new(),
            statuses: HashMap::new(),
            topics: HashMap::new(),
            broker_subscribed: Vec::new(),
            broker_unsubscribed: Vec::new(),
        }
    }
}

/// Recording fake of the native layer
#[derive(Debug)]
pub struct MockNative {
    router: Arc<EventRouter>,
    state: Mutex<MockState>,
}

impl MockNative {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self {
            router,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Answer `create_mqtt` with `clientInit = value`, or never when `None`
    pub fn with_init_response(self, response: Option<bool>) -> Self {
        self.state.lock().init_response = response;
        self
    }

    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        self.set_connect_behavior(behavior);
        self
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect_behavior = behavior;
    }

    /// Make every later call of `operation` fail synchronously
    pub fn fail_operation(&self, operation: NativeOperation) {
        let mut state = self.state.lock();
        if !state.failing.contains(&operation) {
            state.failing.push(operation);
        }
    }

    pub fn restore_operation(&self, operation: NativeOperation) {
        self.state.lock().failing.retain(|op| *op != operation);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn connect_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, NativeCall::Connect { .. }))
            .count()
    }

    /// Topics the simulated broker was asked to subscribe, in order
    pub fn broker_subscribed_topics(&self) -> Vec<String> {
        self.state.lock().broker_subscribed.clone()
    }

    /// Topics the simulated broker was asked to unsubscribe, in order
    pub fn broker_unsubscribed_topics(&self) -> Vec<String> {
        self.state.lock().broker_unsubscribed.clone()
    }

    /// Subscription ids currently holding `topic` for `client_id`
    pub fn subscribers(&self, client_id: &str, topic: &str) -> Vec<SubscriptionId> {
        self.state
            .lock()
            .topics
            .get(&(client_id.to_string(), topic.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn emit_initialized(&self, client_id: &str, client_init: bool) -> usize {
        self.router.emit(
            &EventKey::client(client_id, EventKind::ClientInitialize),
            &EventPayload::from_typed(&ClientInitializeEvent { client_init }),
        )
    }

    pub fn emit_connected(&self, client_id: &str) -> usize {
        self.set_status(client_id, ConnectionStatus::Connected);
        self.router.emit(
            &EventKey::client(client_id, EventKind::Connected),
            &EventPayload::from_typed(&ConnectedEvent {
                reason_code: ReasonCode::NORMAL_DISCONNECTION,
            }),
        )
    }

    pub fn emit_disconnected(&self, client_id: &str, reason_code: ReasonCode) -> usize {
        self.set_status(client_id, ConnectionStatus::Disconnected);
        self.router.emit(
            &EventKey::client(client_id, EventKind::Disconnected),
            &EventPayload::from_typed(&DisconnectedEvent {
                reason_code,
                error_message: None,
            }),
        )
    }

    pub fn emit_error(&self, client_id: &str, event: MqttErrorEvent) -> usize {
        self.router.emit(
            &EventKey::client(client_id, EventKind::MqttError),
            &EventPayload::from_typed(&event),
        )
    }

    pub fn emit_message(&self, subscription_id: &SubscriptionId, topic: &str, payload: &str, qos: Qos) -> usize {
        self.router.emit(
            &EventKey::subscription(subscription_id, EventKind::Message),
            &EventPayload::from_typed(&MessageEvent {
                payload: payload.to_string(),
                topic: topic.to_string(),
                qos,
            }),
        )
    }

    /// Deliver a publish to every subscription id of `client_id` on `topic`
    pub fn publish(&self, client_id: &str, topic: &str, payload: &str, qos: Qos) -> usize {
        self.subscribers(client_id, topic)
            .iter()
            .map(|id| self.emit_message(id, topic, payload, qos))
            .sum()
    }

    pub fn emit_subscribe_success(&self, subscription_id: &SubscriptionId, topic: &str, qos: Qos) -> usize {
        self.router.emit(
            &EventKey::subscription(subscription_id, EventKind::SubscribeSuccess),
            &EventPayload::from_typed(&SubscribeSuccessEvent {
                message: format!("Subscribed to {topic}"),
                topic: topic.to_string(),
                qos,
            }),
        )
    }

    pub fn emit_subscribe_failed(&self, subscription_id: &SubscriptionId, error_message: &str) -> usize {
        self.router.emit(
            &EventKey::subscription(subscription_id, EventKind::SubscribeFailed),
            &EventPayload::from_typed(&SubscribeFailedEvent {
                error_message: error_message.to_string(),
                topic: None,
                reason_code: Some(ReasonCode::SUBSCRIPTION_ERROR),
            }),
        )
    }

    fn set_status(&self, client_id: &str, status: ConnectionStatus) {
        self.state.lock().statuses.insert(client_id.to_string(), status);
    }

    /// Record the call and apply the configured failure, if any
    fn record(&self, operation: NativeOperation, call: NativeCall) -> NativeResult {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(&operation) {
            return Err(NativeError::Rejected {
                operation,
                message: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

impl NativeMqtt for MockNative {
    fn create_mqtt(&self, client_id: &str, host: &str, port: u16, enable_ssl: bool) -> NativeResult {
        self.record(
            NativeOperation::Create,
            NativeCall::Create {
                client_id: client_id.to_string(),
                host: host.to_string(),
                port,
                enable_ssl,
            },
        )?;

        let response = {
            let mut state = self.state.lock();
            state
                .statuses
                .insert(client_id.to_string(), ConnectionStatus::Disconnected);
            state.init_response
        };
        if let Some(client_init) = response {
            self.emit_initialized(client_id, client_init);
        }
        Ok(())
    }

    fn remove_mqtt(&self, client_id: &str) -> NativeResult {
        self.record(
            NativeOperation::Remove,
            NativeCall::Remove {
                client_id: client_id.to_string(),
            },
        )?;

        let mut state = self.state.lock();
        state.statuses.remove(client_id);
        state.topics.retain(|(owner, _), _| owner != client_id);
        Ok(())
    }

    fn connect_mqtt(&self, client_id: &str, options: &NativeConnectOptions) -> NativeResult {
        self.record(
            NativeOperation::Connect,
            NativeCall::Connect {
                client_id: client_id.to_string(),
                options: options.clone(),
            },
        )?;

        let behavior = {
            let mut state = self.state.lock();
            state
                .statuses
                .insert(client_id.to_string(), ConnectionStatus::Connecting);
            state.connect_behavior
        };
        match behavior {
            ConnectBehavior::Manual => {}
            ConnectBehavior::Accept => {
                self.emit_connected(client_id);
            }
            ConnectBehavior::Refuse(reason_code) => {
                self.emit_disconnected(client_id, reason_code);
            }
        }
        Ok(())
    }

    fn disconnect_mqtt(&self, client_id: &str) -> NativeResult {
        self.record(
            NativeOperation::Disconnect,
            NativeCall::Disconnect {
                client_id: client_id.to_string(),
            },
        )?;
        self.set_status(client_id, ConnectionStatus::Disconnected);
        Ok(())
    }

    fn subscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
        qos: Qos,
    ) -> NativeResult {
        self.record(
            NativeOperation::Subscribe,
            NativeCall::Subscribe {
                subscription_id: subscription_id.clone(),
                client_id: client_id.to_string(),
                topic: topic.to_string(),
                qos,
            },
        )?;

        let mut state = self.state.lock();
        let ids = state
            .topics
            .entry((client_id.to_string(), topic.to_string()))
            .or_default();
        let first = ids.is_empty();
        ids.insert(subscription_id.clone());
        if first {
            state.broker_subscribed.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
    ) -> NativeResult {
        self.record(
            NativeOperation::Unsubscribe,
            NativeCall::Unsubscribe {
                subscription_id: subscription_id.clone(),
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            },
        )?;

        let mut state = self.state.lock();
        let key = (client_id.to_string(), topic.to_string());
        let released = match state.topics.get_mut(&key) {
            Some(ids) => ids.remove(subscription_id) && ids.is_empty(),
            None => false,
        };
        if released {
            state.topics.remove(&key);
            state.broker_unsubscribed.push(topic.to_string());
        }
        Ok(())
    }

    fn connection_status_mqtt(&self, client_id: &str) -> ConnectionStatus {
        self.state
            .lock()
            .statuses
            .get(client_id)
            .copied()
            .unwrap_or(ConnectionStatus::Disconnected)
    }
}
