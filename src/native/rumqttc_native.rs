//! Native layer backed by rumqttc (MQTT v5)
//!
//! A single worker task owns every native client and executes operations in
//! the order they were requested. Each connected client additionally runs an
//! event loop task that turns broker traffic into router events.
//!
//! Topic-level reference counting lives in [`TopicTable`]: several
//! subscription ids can share one broker subscription, which is only
//! released when the last id goes away.

use parking_lot::{Mutex, RwLock};
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::{Outgoing, Transport};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{NativeError, NativeMqtt, NativeOperation, NativeResult};
use crate::error::{sanitize_error_message, BridgeError, BridgeResult};
use crate::protocol::{
    ClientInitializeEvent, ConnectedEvent, ConnectionStatus, DisconnectedEvent, EventKey,
    EventKind, EventPayload, MessageEvent, MqttErrorEvent, NativeConnectOptions, Qos, ReasonCode,
    SubscribeFailedEvent, SubscribeSuccessEvent, SubscriptionId,
};
use crate::router::EventRouter;

const REQUEST_CHANNEL_CAPACITY: usize = 10;

fn to_rumqttc_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_rumqttc_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
///
/// Wildcards in the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Subscriber {
    qos: Qos,
    /// Success or failure was already reported for this id
    notified: bool,
}

#[derive(Debug, Default)]
struct TopicEntry {
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
}

impl TopicEntry {
    fn max_qos(&self) -> Option<Qos> {
        self.subscribers.values().map(|s| s.qos).max()
    }
}

/// Result of adding a subscription id to a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAdd {
    /// First id on the topic, or a higher QoS: the broker must be asked
    SubscribeBroker(Qos),
    /// An existing broker subscription already covers this id
    AlreadySubscribed,
}

/// Result of releasing a subscription id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRemove {
    /// Other ids still use the topic
    Retained,
    /// Last id gone: unsubscribe at the broker
    Released,
    /// The id was not subscribed to this topic
    Unknown,
}

/// `topic -> {subscription id -> qos}` with reference counting
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: BTreeMap<String, TopicEntry>,
}

impl TopicTable {
    pub fn add(&mut self, topic: &str, id: SubscriptionId, qos: Qos) -> TopicAdd {
        let entry = self.topics.entry(topic.to_string()).or_default();
        let previous = entry.max_qos();
        entry.subscribers.insert(
            id,
            Subscriber {
                qos,
                notified: false,
            },
        );

        match previous {
            Some(previous) if qos <= previous => TopicAdd::AlreadySubscribed,
            _ => TopicAdd::SubscribeBroker(qos),
        }
    }

    pub fn remove(&mut self, topic: &str, id: &SubscriptionId) -> TopicRemove {
        let Some(entry) = self.topics.get_mut(topic) else {
            return TopicRemove::Unknown;
        };
        if entry.subscribers.remove(id).is_none() {
            return TopicRemove::Unknown;
        }
        if entry.subscribers.is_empty() {
            self.topics.remove(topic);
            TopicRemove::Released
        } else {
            TopicRemove::Retained
        }
    }

    /// True once any id of the topic was acknowledged by the broker
    pub fn is_confirmed(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|entry| entry.subscribers.values().any(|s| s.notified))
            .unwrap_or(false)
    }

    /// Mark every not yet notified id of `topic` as notified and return them
    pub fn take_unnotified(&mut self, topic: &str) -> Vec<(SubscriptionId, Qos)> {
        let Some(entry) = self.topics.get_mut(topic) else {
            return Vec::new();
        };
        entry
            .subscribers
            .iter_mut()
            .filter(|(_, s)| !s.notified)
            .map(|(id, s)| {
                s.notified = true;
                (id.clone(), s.qos)
            })
            .collect()
    }

    pub fn mark_notified(&mut self, topic: &str, id: &SubscriptionId) {
        if let Some(subscriber) = self
            .topics
            .get_mut(topic)
            .and_then(|entry| entry.subscribers.get_mut(id))
        {
            subscriber.notified = true;
        }
    }

    /// Broker subscriptions to (re)issue, at the highest requested QoS
    pub fn filters(&self) -> Vec<(String, Qos)> {
        self.topics
            .iter()
            .filter_map(|(topic, entry)| entry.max_qos().map(|qos| (topic.clone(), qos)))
            .collect()
    }

    /// Subscription ids whose filter matches an incoming topic
    pub fn matching(&self, topic: &str) -> Vec<SubscriptionId> {
        self.topics
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .flat_map(|(_, entry)| entry.subscribers.keys().cloned())
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.topics.values().map(|e| e.subscribers.len()).sum()
    }
}

/// Maps SUBSCRIBE packet ids back to topics
#[derive(Debug, Default)]
struct AckTracker {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

#[derive(Debug, Default)]
struct SubscriptionBook {
    table: TopicTable,
    acks: AckTracker,
}

type SharedBook = Arc<Mutex<SubscriptionBook>>;

#[derive(Debug, Clone, Copy)]
struct ClientStatus {
    status: ConnectionStatus,
    /// Incremented per connection; events of older connections are dropped
    generation: u64,
}

struct Shared {
    router: Arc<EventRouter>,
    clients: RwLock<HashMap<String, ClientStatus>>,
}

impl Shared {
    fn emit(&self, key: EventKey, payload: EventPayload) {
        self.router.emit(&key, &payload);
    }

    fn is_current(&self, client_id: &str, generation: u64) -> bool {
        self.clients
            .read()
            .get(client_id)
            .map(|c| c.generation == generation)
            .unwrap_or(false)
    }

    fn set_status(&self, client_id: &str, generation: u64, status: ConnectionStatus) -> bool {
        let mut clients = self.clients.write();
        match clients.get_mut(client_id) {
            Some(client) if client.generation == generation => {
                client.status = status;
                true
            }
            _ => false,
        }
    }

    fn emit_error(&self, client_id: &str, event: MqttErrorEvent) {
        self.emit(
            EventKey::client(client_id, EventKind::MqttError),
            EventPayload::from_typed(&event),
        );
    }
}

#[derive(Debug)]
enum Command {
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

/// [`NativeMqtt`] implementation over rumqttc
pub struct RumqttcNative {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl RumqttcNative {
    /// Start the worker on the current tokio runtime
    pub fn new(router: Arc<EventRouter>) -> BridgeResult<Self> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::RuntimeUnavailable {
            what: "the native MQTT worker",
        })?;

        let shared = Arc::new(Shared {
            router,
            clients: RwLock::new(HashMap::new()),
        });
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_worker(receiver, Arc::clone(&shared)));

        Ok(Self {
            commands,
            shared,
            worker,
        })
    }

    fn ensure_known(&self, operation: NativeOperation, client_id: &str) -> NativeResult {
        if self.shared.clients.read().contains_key(client_id) {
            Ok(())
        } else {
            Err(NativeError::unknown_client(operation, client_id))
        }
    }

    fn send(&self, operation: NativeOperation, command: Command) -> NativeResult {
        self.commands
            .send(command)
            .map_err(|_| NativeError::WorkerUnavailable { operation })
    }
}

impl Drop for RumqttcNative {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl NativeMqtt for RumqttcNative {
    fn create_mqtt(&self, client_id: &str, host: &str, port: u16, enable_ssl: bool) -> NativeResult {
        self.shared
            .clients
            .write()
            .entry(client_id.to_string())
            .or_insert(ClientStatus {
                status: ConnectionStatus::Disconnected,
                generation: 0,
            });
        self.send(
            NativeOperation::Create,
            Command::Create {
                client_id: client_id.to_string(),
                host: host.to_string(),
                port,
                enable_ssl,
            },
        )
    }

    fn remove_mqtt(&self, client_id: &str) -> NativeResult {
        self.ensure_known(NativeOperation::Remove, client_id)?;
        self.send(
            NativeOperation::Remove,
            Command::Remove {
                client_id: client_id.to_string(),
            },
        )
    }

    fn connect_mqtt(&self, client_id: &str, options: &NativeConnectOptions) -> NativeResult {
        self.ensure_known(NativeOperation::Connect, client_id)?;
        self.send(
            NativeOperation::Connect,
            Command::Connect {
                client_id: client_id.to_string(),
                options: options.clone(),
            },
        )
    }

    fn disconnect_mqtt(&self, client_id: &str) -> NativeResult {
        self.ensure_known(NativeOperation::Disconnect, client_id)?;
        self.send(
            NativeOperation::Disconnect,
            Command::Disconnect {
                client_id: client_id.to_string(),
            },
        )
    }

    fn subscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
        qos: Qos,
    ) -> NativeResult {
        self.ensure_known(NativeOperation::Subscribe, client_id)?;
        self.send(
            NativeOperation::Subscribe,
            Command::Subscribe {
                subscription_id: subscription_id.clone(),
                client_id: client_id.to_string(),
                topic: topic.to_string(),
                qos,
            },
        )
    }

    fn unsubscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
    ) -> NativeResult {
        self.ensure_known(NativeOperation::Unsubscribe, client_id)?;
        self.send(
            NativeOperation::Unsubscribe,
            Command::Unsubscribe {
                subscription_id: subscription_id.clone(),
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            },
        )
    }

    fn connection_status_mqtt(&self, client_id: &str) -> ConnectionStatus {
        self.shared
            .clients
            .read()
            .get(client_id)
            .map(|c| c.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }
}

struct LiveConnection {
    client: AsyncClient,
    task: JoinHandle<()>,
}

struct NativeSlot {
    host: String,
    port: u16,
    enable_ssl: bool,
    book: SharedBook,
    connection: Option<LiveConnection>,
}

impl NativeSlot {
    fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Command>, shared: Arc<Shared>) {
    let mut slots: HashMap<String, NativeSlot> = HashMap::new();
    debug!("Native MQTT worker started");

    while let Some(command) = receiver.recv().await {
        handle_command(&mut slots, &shared, command);
    }

    for slot in slots.values_mut() {
        slot.stop();
    }
    debug!("Native MQTT worker stopped");
}

fn handle_command(slots: &mut HashMap<String, NativeSlot>, shared: &Arc<Shared>, command: Command) {
    match command {
        Command::Create {
            client_id,
            host,
            port,
            enable_ssl,
        } => {
            if let Some(mut previous) = slots.remove(&client_id) {
                previous.stop();
            }
            slots.insert(
                client_id.clone(),
                NativeSlot {
                    host,
                    port,
                    enable_ssl,
                    book: SharedBook::default(),
                    connection: None,
                },
            );
            info!(client_id = %client_id, enable_ssl, "Native MQTT client created");
            shared.emit(
                EventKey::client(&client_id, EventKind::ClientInitialize),
                EventPayload::from_typed(&ClientInitializeEvent { client_init: true }),
            );
        }
        Command::Remove { client_id } => {
            if let Some(mut slot) = slots.remove(&client_id) {
                if let Some(connection) = &slot.connection {
                    let _ = connection.client.try_disconnect();
                }
                slot.stop();
            }
            shared.clients.write().remove(&client_id);
            info!(client_id = %client_id, "Native MQTT client removed");
        }
        Command::Connect { client_id, options } => {
            let Some(slot) = slots.get_mut(&client_id) else {
                report_unknown(shared, &client_id, NativeOperation::Connect);
                return;
            };
            connect_slot(shared, &client_id, slot, &options);
        }
        Command::Disconnect { client_id } => {
            let Some(slot) = slots.get_mut(&client_id) else {
                report_unknown(shared, &client_id, NativeOperation::Disconnect);
                return;
            };
            disconnect_slot(shared, &client_id, slot);
        }
        Command::Subscribe {
            subscription_id,
            client_id,
            topic,
            qos,
        } => {
            let Some(slot) = slots.get_mut(&client_id) else {
                report_unknown(shared, &client_id, NativeOperation::Subscribe);
                return;
            };
            subscribe_slot(shared, &client_id, slot, subscription_id, &topic, qos);
        }
        Command::Unsubscribe {
            subscription_id,
            client_id,
            topic,
        } => {
            let Some(slot) = slots.get_mut(&client_id) else {
                debug!(client_id = %client_id, "Unsubscribe for a removed client ignored");
                return;
            };
            unsubscribe_slot(shared, &client_id, slot, &subscription_id, &topic);
        }
    }
}

fn report_unknown(shared: &Shared, client_id: &str, operation: NativeOperation) {
    let error = NativeError::unknown_client(operation, client_id);
    warn!(error = %error, "Native operation on unknown client");
    shared.emit_error(
        client_id,
        MqttErrorEvent {
            error_message: error.to_string(),
            error_type: Some(operation.to_string()),
            reason_code: operation.reason_code(),
            ..Default::default()
        },
    );
}

fn build_options(client_id: &str, slot: &NativeSlot, options: &NativeConnectOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, slot.host.clone(), slot.port);
    mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive)));
    mqtt_options.set_clean_start(options.clean_session);
    if !options.username.is_empty() {
        mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    }
    if slot.enable_ssl {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }
    mqtt_options
}

fn connect_slot(
    shared: &Arc<Shared>,
    client_id: &str,
    slot: &mut NativeSlot,
    options: &NativeConnectOptions,
) {
    slot.stop();

    let generation = {
        let mut clients = shared.clients.write();
        let Some(status) = clients.get_mut(client_id) else {
            return;
        };
        status.generation += 1;
        status.status = ConnectionStatus::Connecting;
        status.generation
    };

    {
        let mut book = slot.book.lock();
        book.acks = AckTracker::default();
    }

    let (client, event_loop) =
        AsyncClient::new(build_options(client_id, slot, options), REQUEST_CHANNEL_CAPACITY);
    let context = LoopContext {
        client_id: client_id.to_string(),
        generation,
        shared: Arc::clone(shared),
        client: client.clone(),
        book: Arc::clone(&slot.book),
    };
    let task = tokio::spawn(drive_event_loop(context, event_loop));
    slot.connection = Some(LiveConnection { client, task });

    info!(
        client_id = %client_id,
        broker = %format!("{}:{}", slot.host, slot.port),
        generation,
        "Native MQTT connection started"
    );
}

fn disconnect_slot(shared: &Shared, client_id: &str, slot: &mut NativeSlot) {
    let current = shared.clients.read().get(client_id).copied();
    let Some(current) = current else {
        return;
    };

    match (&slot.connection, current.status) {
        (Some(connection), ConnectionStatus::Connected) => {
            // The event loop reports the disconnect once the packet is out.
            if let Err(e) = connection.client.try_disconnect() {
                warn!(client_id = %client_id, error = %e, "Graceful disconnect failed");
                slot.stop();
                finish_disconnect(shared, client_id, current.generation, ReasonCode::DISCONNECTION_ERROR);
            }
        }
        (Some(_), _) => {
            slot.stop();
            finish_disconnect(shared, client_id, current.generation, ReasonCode::NORMAL_DISCONNECTION);
        }
        (None, _) => {
            debug!(client_id = %client_id, "Disconnect without a live connection");
        }
    }
}

fn finish_disconnect(shared: &Shared, client_id: &str, generation: u64, reason_code: ReasonCode) {
    if shared.set_status(client_id, generation, ConnectionStatus::Disconnected) {
        shared.emit(
            EventKey::client(client_id, EventKind::Disconnected),
            EventPayload::from_typed(&DisconnectedEvent {
                reason_code,
                error_message: None,
            }),
        );
    }
}

fn subscribe_slot(
    shared: &Shared,
    client_id: &str,
    slot: &mut NativeSlot,
    subscription_id: SubscriptionId,
    topic: &str,
    qos: Qos,
) {
    let connected = shared
        .clients
        .read()
        .get(client_id)
        .map(|c| c.status == ConnectionStatus::Connected)
        .unwrap_or(false);

    let mut book = slot.book.lock();
    let outcome = book.table.add(topic, subscription_id.clone(), qos);
    debug!(client_id = %client_id, topic = %topic, outcome = ?outcome, "Subscription recorded");

    let Some(connection) = slot.connection.as_ref().filter(|_| connected) else {
        // Issued on the next ConnAck
        return;
    };

    match outcome {
        TopicAdd::SubscribeBroker(qos) => {
            match connection.client.try_subscribe(topic, to_rumqttc_qos(qos)) {
                Ok(()) => book.acks.queued.push_back(topic.to_string()),
                Err(e) => {
                    book.table.mark_notified(topic, &subscription_id);
                    drop(book);
                    error!(client_id = %client_id, topic = %topic, error = %e, "Subscribe request failed");
                    shared.emit(
                        EventKey::subscription(&subscription_id, EventKind::SubscribeFailed),
                        EventPayload::from_typed(&SubscribeFailedEvent {
                            error_message: sanitize_error_message(&e.to_string()),
                            topic: Some(topic.to_string()),
                            reason_code: Some(ReasonCode::SUBSCRIPTION_ERROR),
                        }),
                    );
                }
            }
        }
        TopicAdd::AlreadySubscribed if book.table.is_confirmed(topic) => {
            book.table.mark_notified(topic, &subscription_id);
            drop(book);
            shared.emit(
                EventKey::subscription(&subscription_id, EventKind::SubscribeSuccess),
                EventPayload::from_typed(&SubscribeSuccessEvent {
                    message: format!("Subscribed to {topic}"),
                    topic: topic.to_string(),
                    qos,
                }),
            );
        }
        TopicAdd::AlreadySubscribed => {}
    }
}

fn unsubscribe_slot(
    shared: &Shared,
    client_id: &str,
    slot: &mut NativeSlot,
    subscription_id: &SubscriptionId,
    topic: &str,
) {
    let outcome = slot.book.lock().table.remove(topic, subscription_id);
    debug!(client_id = %client_id, topic = %topic, outcome = ?outcome, "Subscription released");

    if outcome != TopicRemove::Released {
        return;
    }
    let Some(connection) = &slot.connection else {
        return;
    };
    if let Err(e) = connection.client.try_unsubscribe(topic) {
        error!(client_id = %client_id, topic = %topic, error = %e, "Unsubscribe request failed");
        shared.emit_error(
            client_id,
            MqttErrorEvent {
                error_message: sanitize_error_message(&e.to_string()),
                error_type: Some(NativeOperation::Unsubscribe.to_string()),
                reason_code: ReasonCode::UNSUBSCRIPTION_ERROR,
                topic: Some(topic.to_string()),
                client_unsubscribed: Some(false),
                ..Default::default()
            },
        );
    }
}

/// State of one event loop task
struct LoopContext {
    client_id: String,
    generation: u64,
    shared: Arc<Shared>,
    client: AsyncClient,
    book: SharedBook,
}

async fn drive_event_loop(context: LoopContext, mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(event) => {
                if !context.handle_event(event) {
                    break;
                }
            }
            Err(e) => {
                context.handle_connection_error(e);
                break;
            }
        }
    }
    debug!(client_id = %context.client_id, generation = context.generation, "Event loop finished");
}

impl LoopContext {
    /// Returns false when the connection is over
    fn handle_event(&self, event: Event) -> bool {
        if !self.shared.is_current(&self.client_id, self.generation) {
            return false;
        }

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.shared
                    .set_status(&self.client_id, self.generation, ConnectionStatus::Connected);
                self.shared.emit(
                    EventKey::client(&self.client_id, EventKind::Connected),
                    EventPayload::from_typed(&ConnectedEvent {
                        reason_code: ReasonCode(ack.code as i32),
                    }),
                );
                self.resubscribe();
                true
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                let qos = from_rumqttc_qos(publish.qos);
                let receivers = self.book.lock().table.matching(&topic);
                if receivers.is_empty() {
                    debug!(client_id = %self.client_id, topic = %topic, "Publish without subscribers");
                }
                for id in receivers {
                    self.shared.emit(
                        EventKey::subscription(&id, EventKind::Message),
                        EventPayload::from_typed(&MessageEvent {
                            payload: payload.clone(),
                            topic: topic.clone(),
                            qos,
                        }),
                    );
                }
                true
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                let granted = suback
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                self.settle_subscription(suback.pkid, granted, &suback.return_codes);
                true
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                self.report_disconnect(ReasonCode(disconnect.reason_code as i32), None);
                false
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut book = self.book.lock();
                if let Some(topic) = book.acks.queued.pop_front() {
                    book.acks.in_flight.insert(pkid, topic);
                }
                true
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                self.report_disconnect(ReasonCode::NORMAL_DISCONNECTION, None);
                false
            }
            _ => true,
        }
    }

    fn handle_connection_error(&self, error: ConnectionError) {
        if !self.shared.is_current(&self.client_id, self.generation) {
            return;
        }
        let reason_code = match &error {
            ConnectionError::ConnectionRefused(code) => ReasonCode(*code as i32),
            _ => ReasonCode::CONNECTION_ERROR,
        };
        warn!(client_id = %self.client_id, error = %error, "MQTT event loop error");
        self.report_disconnect(reason_code, Some(sanitize_error_message(&error.to_string())));
    }

    fn report_disconnect(&self, reason_code: ReasonCode, error_message: Option<String>) {
        if self
            .shared
            .set_status(&self.client_id, self.generation, ConnectionStatus::Disconnected)
        {
            self.shared.emit(
                EventKey::client(&self.client_id, EventKind::Disconnected),
                EventPayload::from_typed(&DisconnectedEvent {
                    reason_code,
                    error_message,
                }),
            );
        }
    }

    /// Re-issue every recorded topic after a (re)connect
    fn resubscribe(&self) {
        let mut book = self.book.lock();
        let filters = book.table.filters();
        for (topic, qos) in filters {
            match self.client.try_subscribe(topic.clone(), to_rumqttc_qos(qos)) {
                Ok(()) => book.acks.queued.push_back(topic),
                Err(e) => {
                    error!(client_id = %self.client_id, topic = %topic, error = %e, "Resubscribe failed");
                }
            }
        }
    }

    fn settle_subscription(&self, pkid: u16, granted: bool, codes: &[SubscribeReasonCode]) {
        let (topic, ids) = {
            let mut book = self.book.lock();
            let Some(topic) = book.acks.in_flight.remove(&pkid) else {
                debug!(client_id = %self.client_id, pkid, "SubAck for unknown packet");
                return;
            };
            let ids = book.table.take_unnotified(&topic);
            (topic, ids)
        };

        for (id, qos) in ids {
            if granted {
                self.shared.emit(
                    EventKey::subscription(&id, EventKind::SubscribeSuccess),
                    EventPayload::from_typed(&SubscribeSuccessEvent {
                        message: format!("Subscribed to {topic}"),
                        topic: topic.clone(),
                        qos,
                    }),
                );
            } else {
                self.shared.emit(
                    EventKey::subscription(&id, EventKind::SubscribeFailed),
                    EventPayload::from_typed(&SubscribeFailedEvent {
                        error_message: format!("Broker rejected subscription: {codes:?}"),
                        topic: Some(topic.clone()),
                        reason_code: Some(ReasonCode::SUBSCRIPTION_ERROR),
                    }),
                );
            }
        }
    }
}
