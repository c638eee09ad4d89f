//! Subscription registry and handles
//!
//! Each `subscribe` call gets its own id and three router listeners
//! (message, success, failure). Topic-level reference counting is the native
//! layer's job; the registry only tracks logical subscriptions so that the
//! owning client can tear them all down on `remove()`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::native::NativeMqtt;
use crate::observability::metrics;
use crate::protocol::{
    EventKey, EventKind, EventPayload, MessageEvent, Qos, ReasonCode, SubscribeFailedEvent,
    SubscribeSuccessEvent, SubscriptionId,
};
use crate::router::{EventRouter, ListenerHandle};

type MessageCallback = Arc<dyn Fn(&MessageEvent) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn(&SubscribeSuccessEvent) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(&SubscribeFailedEvent) + Send + Sync>;

/// Arguments of [`MqttClient::subscribe`](crate::client::MqttClient::subscribe)
#[derive(Clone)]
pub struct SubscribeRequest {
    pub topic: String,
    pub qos: Qos,
    on_event: MessageCallback,
    on_success: Option<SuccessCallback>,
    on_error: Option<FailureCallback>,
}

impl SubscribeRequest {
    /// New request at QoS 1
    pub fn new<F>(topic: impl Into<String>, on_event: F) -> Self
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            qos: Qos::default(),
            on_event: Arc::new(on_event),
            on_success: None,
            on_error: None,
        }
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SubscribeSuccessEvent) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SubscribeFailedEvent) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn report_failure(&self, event: &SubscribeFailedEvent) {
        if let Some(on_error) = &self.on_error {
            on_error(event);
        }
    }
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// One live logical subscription
pub(crate) struct SubscriptionEntry {
    id: SubscriptionId,
    topic: String,
    qos: Qos,
    listeners: Mutex<Vec<ListenerHandle>>,
    removed: AtomicBool,
}

impl SubscriptionEntry {
    fn inert(id: SubscriptionId, topic: String, qos: Qos) -> Self {
        Self {
            id,
            topic,
            qos,
            listeners: Mutex::new(Vec::new()),
            removed: AtomicBool::new(true),
        }
    }

    /// Detach the router listeners; true only for the first caller
    pub(crate) fn detach(&self) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for listener in self.listeners.lock().drain(..) {
            listener.remove();
        }
        metrics().subscription_released();
        true
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Per-client registry of live subscriptions
pub(crate) struct SubscriptionRegistry {
    client_id: String,
    tag: u64,
    entries: HashMap<SubscriptionId, Arc<SubscriptionEntry>>,
    /// Set by the client's teardown; no entry is registered afterwards
    closed: bool,
}

impl SubscriptionRegistry {
    pub(crate) fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            tag: 0,
            entries: HashMap::new(),
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pre-incremented tag: the first id ends in `#1`
    pub(crate) fn next_id(&mut self, topic: &str, qos: Qos) -> SubscriptionId {
        self.tag += 1;
        SubscriptionId::generate(&self.client_id, topic, qos, self.tag)
    }

    /// Allocate an id and attach the three listeners of `request`
    pub(crate) fn register(
        &mut self,
        router: &EventRouter,
        request: &SubscribeRequest,
    ) -> Arc<SubscriptionEntry> {
        let id = self.next_id(&request.topic, request.qos);
        let listeners = attach_listeners(router, &id, request);

        let entry = Arc::new(SubscriptionEntry {
            id: id.clone(),
            topic: request.topic.clone(),
            qos: request.qos,
            listeners: Mutex::new(listeners),
            removed: AtomicBool::new(false),
        });
        self.entries.insert(id, Arc::clone(&entry));
        metrics().subscription_added();
        entry
    }

    /// Entry that was never registered, for subscribe calls on a removed client
    pub(crate) fn inert_entry(&mut self, request: &SubscribeRequest) -> Arc<SubscriptionEntry> {
        let id = self.next_id(&request.topic, request.qos);
        Arc::new(SubscriptionEntry::inert(
            id,
            request.topic.clone(),
            request.qos,
        ))
    }

    pub(crate) fn remove(&mut self, id: &SubscriptionId) -> Option<Arc<SubscriptionEntry>> {
        self.entries.remove(id)
    }

    /// Close the registry and hand back every live entry
    pub(crate) fn close(&mut self) -> Vec<Arc<SubscriptionEntry>> {
        self.closed = true;
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Live subscriptions per topic
    #[cfg(test)]
    pub(crate) fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.topic.clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn attach_listeners(
    router: &EventRouter,
    id: &SubscriptionId,
    request: &SubscribeRequest,
) -> Vec<ListenerHandle> {
    let mut listeners = Vec::with_capacity(3);

    let on_event = Arc::clone(&request.on_event);
    let message_key = EventKey::subscription(id, EventKind::Message);
    let event_name = message_key.event_name();
    listeners.push(router.add_listener(&message_key, move |payload: &EventPayload| {
        match payload.decode::<MessageEvent>() {
            Ok(message) => on_event(&message),
            Err(e) => warn!(
                error = %BridgeError::invalid_payload(event_name.as_str(), e),
                "Dropping undecodable message"
            ),
        }
    }));

    let on_success = request.on_success.clone();
    let topic = request.topic.clone();
    let qos = request.qos;
    listeners.push(router.add_listener(
        &EventKey::subscription(id, EventKind::SubscribeSuccess),
        move |payload: &EventPayload| {
            let ack = payload
                .decode::<SubscribeSuccessEvent>()
                .unwrap_or_else(|_| SubscribeSuccessEvent {
                    message: payload.get_str("message").unwrap_or_default().to_string(),
                    topic: topic.clone(),
                    qos,
                });
            debug!(topic = %ack.topic, qos = %ack.qos, "Subscription acknowledged");
            if let Some(on_success) = &on_success {
                on_success(&ack);
            }
        },
    ));

    let on_error = request.on_error.clone();
    let topic = request.topic.clone();
    listeners.push(router.add_listener(
        &EventKey::subscription(id, EventKind::SubscribeFailed),
        move |payload: &EventPayload| {
            let mut failure = payload.decode::<SubscribeFailedEvent>().unwrap_or_default();
            if failure.topic.is_none() {
                failure.topic = Some(topic.clone());
            }
            warn!(topic = %topic, error = %failure.error_message, "Subscription failed");
            if let Some(on_error) = &on_error {
                on_error(&failure);
            }
        },
    ));

    listeners
}

pub(crate) fn rejected_subscription(topic: &str, error: &BridgeError) -> SubscribeFailedEvent {
    SubscribeFailedEvent {
        error_message: error.to_string(),
        topic: Some(topic.to_string()),
        reason_code: Some(ReasonCode::SUBSCRIPTION_ERROR),
    }
}

/// Handle returned by `subscribe`
///
/// `remove()` detaches the listeners and asks the native layer to release
/// this subscription id. It is idempotent, and inert once the owning client
/// was removed.
pub struct SubscriptionHandle {
    entry: Arc<SubscriptionEntry>,
    client_id: String,
    native: Arc<dyn NativeMqtt>,
    registry: Weak<Mutex<SubscriptionRegistry>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        entry: Arc<SubscriptionEntry>,
        client_id: String,
        native: Arc<dyn NativeMqtt>,
        registry: Weak<Mutex<SubscriptionRegistry>>,
    ) -> Self {
        Self {
            entry,
            client_id,
            native,
            registry,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.entry.id
    }

    pub fn topic(&self) -> &str {
        &self.entry.topic
    }

    pub fn qos(&self) -> Qos {
        self.entry.qos
    }

    pub fn is_active(&self) -> bool {
        !self.entry.is_removed()
    }

    pub fn remove(&self) {
        if !self.entry.detach() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.entry.id);
        }

        debug!(
            client_id = %self.client_id,
            subscription_id = %self.entry.id,
            topic = %self.entry.topic,
            "Releasing subscription"
        );
        if let Err(e) = self
            .native
            .unsubscribe_mqtt(&self.entry.id, &self.client_id, &self.entry.topic)
        {
            warn!(
                client_id = %self.client_id,
                topic = %self.entry.topic,
                error = %e,
                "Native unsubscribe failed"
            );
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.entry.id)
            .field("topic", &self.entry.topic)
            .field("active", &self.is_active())
            .finish()
    }
}
