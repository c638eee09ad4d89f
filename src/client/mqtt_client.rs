//! Connection state machine
//!
//! An [`MqttClient`] owns its connection status, retry bookkeeping,
//! reconnect interceptor and subscription registry. It never blocks: native
//! operations are requests whose outcomes come back as router events, and the
//! only suspension points are the backoff timer and the interceptor future.
//!
//! Lock discipline: the state lock is never held while calling the native
//! layer or emitting through the router, and it is always taken before the
//! backoff lock.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reconnect::{decide_reconnection, BackoffCalculator, ReconnectPolicy, ReconnectionDecision};
use super::state::{self, DisconnectKind, DisconnectType};
use super::subscription::{rejected_subscription, SubscribeRequest, SubscriptionHandle, SubscriptionRegistry};
use crate::client_span;
use crate::error::{BoxError, BridgeError};
use crate::native::NativeMqtt;
use crate::observability::metrics;
use crate::protocol::{
    ClientIdentity, ClientInitializeEvent, ConnectedEvent, ConnectionOptions, ConnectionStatus,
    DisconnectedEvent, EventKey, EventKind, EventPayload, MqttErrorEvent, ReasonCode,
};
use crate::router::{EventRouter, ListenerHandle};

/// Hook consulted before every automatic reconnection attempt
///
/// Receives the reason code of the most recent disconnect and may return
/// options (typically refreshed credentials) to merge before reconnecting.
/// An error abandons the reconnection cycle.
#[async_trait]
pub trait ReconnectInterceptor: Send + Sync {
    async fn intercept(
        &self,
        last_reason: Option<ReasonCode>,
    ) -> Result<Option<ConnectionOptions>, BoxError>;
}

struct FnInterceptor<F>(F);

#[async_trait]
impl<F, Fut> ReconnectInterceptor for FnInterceptor<F>
where
    F: Fn(Option<ReasonCode>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<ConnectionOptions>, BoxError>> + Send + 'static,
{
    async fn intercept(
        &self,
        last_reason: Option<ReasonCode>,
    ) -> Result<Option<ConnectionOptions>, BoxError> {
        (self.0)(last_reason).await
    }
}

/// Extra context handed to disconnect callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectInfo {
    pub options: ConnectionOptions,
    pub disconnect_type: DisconnectType,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    Application,
    Retry,
}

#[derive(Default)]
struct RetryState {
    current_retry_count: u32,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every cancellation; a timer only acts on its own generation
    generation: u64,
    disconnect_reason_code: Option<ReasonCode>,
    /// Inside a reconnection cycle started by a lost connection
    in_cycle: bool,
}

impl RetryState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    fn end_cycle(&mut self) {
        self.cancel_timer();
        self.in_cycle = false;
    }
}

#[derive(Debug, Clone, Copy)]
struct DisconnectSnapshot {
    prior_status: ConnectionStatus,
    reason_code: ReasonCode,
}

struct ClientState {
    options: ConnectionOptions,
    status: ConnectionStatus,
    retry: RetryState,
    interceptor: Option<(u64, Arc<dyn ReconnectInterceptor>)>,
    last_disconnect: Option<DisconnectSnapshot>,
    lifecycle: Vec<ListenerHandle>,
    removed: bool,
}

pub(crate) struct ClientInner {
    identity: ClientIdentity,
    native: Arc<dyn NativeMqtt>,
    router: Arc<EventRouter>,
    state: Mutex<ClientState>,
    subscriptions: Arc<Mutex<SubscriptionRegistry>>,
    backoff: Mutex<BackoffCalculator>,
    next_interceptor_id: AtomicU64,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().retry.timer.take() {
            timer.abort();
        }
    }
}

/// Handle to one logical MQTT connection
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl MqttClient {
    pub(crate) fn new(
        identity: ClientIdentity,
        options: ConnectionOptions,
        native: Arc<dyn NativeMqtt>,
        router: Arc<EventRouter>,
        backoff: BackoffCalculator,
    ) -> Self {
        let subscriptions = Arc::new(Mutex::new(SubscriptionRegistry::new(
            identity.client_id.clone(),
        )));
        Self {
            inner: Arc::new(ClientInner {
                identity,
                native,
                router,
                state: Mutex::new(ClientState {
                    options,
                    status: ConnectionStatus::Disconnected,
                    retry: RetryState::default(),
                    interceptor: None,
                    last_disconnect: None,
                    lifecycle: Vec::new(),
                    removed: false,
                }),
                subscriptions,
                backoff: Mutex::new(backoff),
                next_interceptor_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register the state machine's own `connected`/`disconnected` handlers
    ///
    /// Must run before any user callback is registered so the status is
    /// already updated when those callbacks observe it.
    pub(crate) fn attach_lifecycle(&self) {
        let client_id = &self.inner.identity.client_id;

        let weak = Arc::downgrade(&self.inner);
        let connected = self.inner.router.add_listener(
            &EventKey::client(client_id, EventKind::Connected),
            move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_connected(payload);
                }
            },
        );

        let weak = Arc::downgrade(&self.inner);
        let disconnected = self.inner.router.add_listener(
            &EventKey::client(client_id, EventKind::Disconnected),
            move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_disconnected(payload);
                }
            },
        );

        self.inner.state.lock().lifecycle.extend([connected, disconnected]);
    }

    /// Detach lifecycle listeners of a client that never became usable
    pub(crate) fn detach_lifecycle(&self) {
        let handles = std::mem::take(&mut self.inner.state.lock().lifecycle);
        for handle in handles {
            handle.remove();
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    pub fn client_id(&self) -> &str {
        &self.inner.identity.client_id
    }

    /// Locally tracked status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Status as reported by the native layer
    pub fn native_connection_status(&self) -> ConnectionStatus {
        self.inner
            .native
            .connection_status_mqtt(&self.inner.identity.client_id)
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry.current_retry_count
    }

    pub fn disconnect_reason_code(&self) -> Option<ReasonCode> {
        self.inner.state.lock().retry.disconnect_reason_code
    }

    /// Current (merged) options
    pub fn options(&self) -> ConnectionOptions {
        self.inner.state.lock().options.clone()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.state.lock().removed
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Connect with the current options
    pub fn connect(&self) {
        self.connect_with(None);
    }

    /// Merge `overrides` into the current options and connect
    ///
    /// Resets the retry count and supersedes any pending retry.
    pub fn connect_with(&self, overrides: Option<ConnectionOptions>) {
        let _span = client_span!(client_id = %self.inner.identity.client_id).entered();
        {
            let mut state = self.inner.state.lock();
            if state.removed {
                warn!("connect() called on a removed client");
                return;
            }
            state.retry.end_cycle();
            state.retry.current_retry_count = 0;
            let from = state.status;
            state.status = ConnectionStatus::Connecting;
            if let Some(overrides) = overrides {
                state.options.merge(overrides);
            }
            state::log_state_transition(&self.inner.identity.client_id, from, state.status);
        }
        self.inner.connection(ConnectOrigin::Application);
    }

    /// Disconnect and cancel any pending retry
    pub fn disconnect(&self) {
        let _span = client_span!(client_id = %self.inner.identity.client_id).entered();
        {
            let mut state = self.inner.state.lock();
            if state.removed {
                debug!("disconnect() called on a removed client");
                return;
            }
            state.retry.end_cycle();
            let from = state.status;
            state.status = ConnectionStatus::Disconnected;
            state::log_state_transition(&self.inner.identity.client_id, from, state.status);
        }

        if let Err(e) = self
            .inner
            .native
            .disconnect_mqtt(&self.inner.identity.client_id)
        {
            error!(error = %e, "Native disconnect failed");
        }
    }

    /// Tear the client down: native remove, timers, listeners, subscriptions
    ///
    /// Idempotent. Afterwards no native event has any effect on this client.
    pub fn remove(&self) {
        let client_id = self.inner.identity.client_id.clone();
        let _span = client_span!(client_id = %client_id).entered();

        let (first_call, lifecycle) = {
            let mut state = self.inner.state.lock();
            let first_call = !state.removed;
            state.removed = true;
            state.retry.end_cycle();
            state.status = ConnectionStatus::Disconnected;
            state.interceptor = None;
            (first_call, std::mem::take(&mut state.lifecycle))
        };

        if first_call {
            if let Err(e) = self.inner.native.remove_mqtt(&client_id) {
                error!(error = %e, "Native remove failed");
            }
        }

        for handle in lifecycle {
            handle.remove();
        }
        for kind in EventKind::CLIENT_KINDS {
            self.inner
                .router
                .remove_all_listeners(&EventKey::client(&client_id, kind));
        }

        let entries = self.inner.subscriptions.lock().close();
        for entry in &entries {
            entry.detach();
        }

        if first_call {
            metrics().client_removed();
            info!(subscriptions = entries.len(), "MQTT client removed");
        }
    }

    /// Subscribe to `request.topic`
    pub fn subscribe(&self, request: SubscribeRequest) -> SubscriptionHandle {
        let client_id = self.inner.identity.client_id.clone();
        let _span = crate::subscription_span!(client_id = %client_id, topic = %request.topic).entered();

        // Decided under the registry lock so a concurrent remove() either
        // drains this entry or makes it inert
        let (entry, removed) = {
            let mut registry = self.inner.subscriptions.lock();
            if registry.is_closed() {
                (registry.inert_entry(&request), true)
            } else {
                (registry.register(&self.inner.router, &request), false)
            }
        };
        let handle = SubscriptionHandle::new(
            entry,
            client_id.clone(),
            Arc::clone(&self.inner.native),
            Arc::downgrade(&self.inner.subscriptions),
        );

        if removed {
            warn!("subscribe() called on a removed client");
            return handle;
        }

        debug!(subscription_id = %handle.id(), qos = %request.qos, "Subscribing");
        if let Err(e) =
            self.inner
                .native
                .subscribe_mqtt(handle.id(), &client_id, &request.topic, request.qos)
        {
            let error = BridgeError::from(e);
            error!(error = %error, "Native subscribe failed");

            let rejected = self.inner.subscriptions.lock().remove(handle.id());
            if let Some(entry) = rejected {
                entry.detach();
            }
            let failure = rejected_subscription(&request.topic, &error);
            if panic::catch_unwind(AssertUnwindSafe(|| request.report_failure(&failure))).is_err() {
                metrics().handler_panicked();
                error!("Subscription error callback panicked");
            }
        }

        handle
    }

    pub fn set_on_init_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ClientInitializeEvent) + Send + Sync + 'static,
    {
        self.inner.router.add_listener(
            &EventKey::client(&self.inner.identity.client_id, EventKind::ClientInitialize),
            move |payload| callback(&payload.decode().unwrap_or_default()),
        )
    }

    pub fn set_on_connect_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectedEvent) + Send + Sync + 'static,
    {
        self.inner.router.add_listener(
            &EventKey::client(&self.inner.identity.client_id, EventKind::Connected),
            move |payload| callback(&payload.decode().unwrap_or_default()),
        )
    }

    /// Fires for a `disconnected` event that arrived while CONNECTING
    pub fn set_on_connect_failure_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(ReasonCode) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.router.add_listener(
            &EventKey::client(&self.inner.identity.client_id, EventKind::Disconnected),
            move |_| {
                let Some(inner) = weak.upgrade() else { return };
                let snapshot = inner.state.lock().last_disconnect;
                if let Some(snapshot) = snapshot {
                    if snapshot.prior_status == ConnectionStatus::Connecting {
                        callback(snapshot.reason_code);
                    }
                }
            },
        )
    }

    /// Fires for every `disconnected` event that is not a connect failure
    pub fn set_on_disconnect_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(ReasonCode, &DisconnectInfo) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.router.add_listener(
            &EventKey::client(&self.inner.identity.client_id, EventKind::Disconnected),
            move |_| {
                let Some(inner) = weak.upgrade() else { return };
                let details = {
                    let state = inner.state.lock();
                    state.last_disconnect.and_then(|snapshot| {
                        (snapshot.prior_status != ConnectionStatus::Connecting).then(|| {
                            (
                                snapshot.reason_code,
                                DisconnectInfo {
                                    options: state.options.clone(),
                                    disconnect_type: state::disconnect_type(snapshot.prior_status),
                                    retry_count: state.retry.current_retry_count,
                                },
                            )
                        })
                    })
                };
                if let Some((reason_code, info)) = details {
                    callback(reason_code, &info);
                }
            },
        )
    }

    pub fn set_on_error_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&MqttErrorEvent) + Send + Sync + 'static,
    {
        self.inner.router.add_listener(
            &EventKey::client(&self.inner.identity.client_id, EventKind::MqttError),
            move |payload| callback(&payload.decode().unwrap_or_default()),
        )
    }

    /// Install an async closure as the reconnect interceptor
    ///
    /// Replaces any previous interceptor.
    pub fn set_on_reconnect_interceptor<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(Option<ReasonCode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ConnectionOptions>, BoxError>> + Send + 'static,
    {
        self.set_reconnect_interceptor(Arc::new(FnInterceptor(interceptor)))
    }

    pub fn set_reconnect_interceptor(
        &self,
        interceptor: Arc<dyn ReconnectInterceptor>,
    ) -> InterceptorHandle {
        let id = self.inner.next_interceptor_id.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().interceptor = Some((id, interceptor));
        InterceptorHandle {
            id,
            client: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MqttClient")
            .field("identity", &self.inner.identity)
            .field("status", &state.status)
            .field("retry_count", &state.retry.current_retry_count)
            .field("removed", &state.removed)
            .finish()
    }
}

/// Handle returned by the interceptor setters
#[derive(Debug)]
pub struct InterceptorHandle {
    id: u64,
    client: Weak<ClientInner>,
}

impl InterceptorHandle {
    /// Uninstall, unless a newer interceptor already replaced this one
    pub fn remove(&self) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if matches!(state.interceptor, Some((id, _)) if id == self.id) {
            state.interceptor = None;
        }
    }
}

impl ClientInner {
    /// Issue the native connect, but only while CONNECTING
    fn connection(&self, origin: ConnectOrigin) {
        let params = {
            let state = self.state.lock();
            if state.removed || !state::can_issue_connect(state.status) {
                debug!(status = %state.status, "Skipping connect: status is no longer connecting");
                return;
            }
            state.options.native_connect_options()
        };

        metrics().connection_attempt();
        info!(
            client_id = %self.identity.client_id,
            broker = %self.identity.broker_url(),
            keep_alive = params.keep_alive,
            clean_session = params.clean_session,
            "Connecting to MQTT broker"
        );

        if let Err(e) = self.native.connect_mqtt(&self.identity.client_id, &params) {
            error!(client_id = %self.identity.client_id, error = %e, "Native connect failed");
            metrics().connection_failed();

            let mut state = self.state.lock();
            if origin == ConnectOrigin::Retry && state.retry.in_cycle {
                state.retry.end_cycle();
                metrics().reconnect_abandoned();
                warn!(client_id = %self.identity.client_id, "Reconnection cycle abandoned");
            }
        }
    }

    fn handle_connected(&self, payload: &EventPayload) {
        let ack: ConnectedEvent = payload.decode().unwrap_or_default();
        let mut state = self.state.lock();
        if state.removed {
            return;
        }

        match state::on_connected(state.status) {
            Some(next) => {
                state::log_state_transition(&self.identity.client_id, state.status, next);
                state.status = next;
                state.retry.end_cycle();
                state.retry.current_retry_count = 0;
                state.retry.disconnect_reason_code = None;
                metrics().connection_established();
                debug!(client_id = %self.identity.client_id, reason_code = %ack.reason_code, "Connected");
            }
            None => {
                debug!(
                    client_id = %self.identity.client_id,
                    status = %state.status,
                    "Ignoring stale connected acknowledgement"
                );
            }
        }
    }

    fn handle_disconnected(self: &Arc<Self>, payload: &EventPayload) {
        let event: DisconnectedEvent = payload.decode().unwrap_or_default();
        let reason_code = event.reason_code;

        let mut state = self.state.lock();
        if state.removed {
            return;
        }

        let prior = state.status;
        state.last_disconnect = Some(DisconnectSnapshot {
            prior_status: prior,
            reason_code,
        });
        state.retry.disconnect_reason_code = Some(reason_code);
        state.status = state::on_disconnected(prior);
        state::log_state_transition(&self.identity.client_id, prior, state.status);

        match state::classify_disconnect(prior) {
            DisconnectKind::ConnectionLost => {
                metrics().connection_lost();
                warn!(
                    client_id = %self.identity.client_id,
                    reason_code = %reason_code,
                    error = event.error_message.as_deref().unwrap_or(""),
                    "Connection lost"
                );
                if state.options.auto_reconnect_enabled() {
                    state.retry.in_cycle = true;
                    self.plan_retry(&mut state);
                }
            }
            DisconnectKind::ConnectFailed => {
                metrics().connection_failed();
                warn!(
                    client_id = %self.identity.client_id,
                    reason_code = %reason_code,
                    "MQTT connection attempt failed"
                );
                // A duplicate failure must not consume another retry
                if state.retry.in_cycle && state.retry.timer.is_none() {
                    self.plan_retry(&mut state);
                }
            }
            DisconnectKind::AfterDisconnect => {
                debug!(client_id = %self.identity.client_id, "Disconnected");
            }
        }
    }

    /// Schedule the next attempt of the current cycle, or end the cycle
    fn plan_retry(self: &Arc<Self>, state: &mut ClientState) {
        let client_id = &self.identity.client_id;
        let policy = ReconnectPolicy::from_options(&state.options);

        match decide_reconnection(state.retry.current_retry_count, &policy) {
            ReconnectionDecision::Proceed { attempt } => {
                state.retry.current_retry_count = attempt;
                let delay_ms = self.backoff.lock().delay_ms(&policy, attempt);
                state.retry.cancel_timer();
                let generation = state.retry.generation;

                match Handle::try_current() {
                    Ok(runtime) => {
                        let weak = Arc::downgrade(self);
                        state.retry.timer = Some(runtime.spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            run_retry(weak, generation).await;
                        }));
                        metrics().reconnect_scheduled();
                        info!(client_id = %client_id, attempt, delay_ms, "Reconnection scheduled");
                    }
                    Err(_) => {
                        let error = BridgeError::RuntimeUnavailable {
                            what: "a reconnection attempt",
                        };
                        error!(client_id = %client_id, error = %error, "Reconnection abandoned");
                        state.retry.in_cycle = false;
                        metrics().reconnect_abandoned();
                    }
                }
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                warn!(
                    client_id = %client_id,
                    attempts = state.retry.current_retry_count,
                    "Reconnection attempts exhausted"
                );
                state.retry.end_cycle();
                metrics().reconnect_abandoned();
            }
            ReconnectionDecision::Disabled => {
                state.retry.end_cycle();
            }
        }
    }
}

/// Body of a fired retry timer
async fn run_retry(weak: Weak<ClientInner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let (interceptor, last_reason) = {
        let mut state = inner.state.lock();
        if state.removed || state.retry.generation != generation {
            return;
        }
        state.retry.timer = None;
        if state.status == ConnectionStatus::Connected {
            state.retry.in_cycle = false;
            return;
        }
        (
            state.interceptor.as_ref().map(|(_, i)| Arc::clone(i)),
            state.retry.disconnect_reason_code,
        )
    };

    let overrides = match interceptor {
        Some(interceptor) => {
            let outcome = AssertUnwindSafe(interceptor.intercept(last_reason))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(overrides)) => overrides,
                Ok(Err(e)) => {
                    let error = BridgeError::Interceptor(e);
                    error!(client_id = %inner.identity.client_id, error = %error, "Reconnection abandoned");
                    abandon_cycle(&inner, generation);
                    return;
                }
                Err(_) => {
                    metrics().handler_panicked();
                    error!(client_id = %inner.identity.client_id, "Reconnect interceptor panicked");
                    abandon_cycle(&inner, generation);
                    return;
                }
            }
        }
        None => None,
    };

    {
        let mut state = inner.state.lock();
        if state.removed || state.retry.generation != generation {
            debug!(client_id = %inner.identity.client_id, "Retry superseded while intercepting");
            return;
        }
        if let Some(overrides) = overrides {
            state.options.merge(overrides);
        }
        let from = state.status;
        state.status = ConnectionStatus::Connecting;
        state::log_state_transition(&inner.identity.client_id, from, state.status);
    }

    inner.connection(ConnectOrigin::Retry);
}

fn abandon_cycle(inner: &ClientInner, generation: u64) {
    metrics().reconnect_abandoned();
    let mut state = inner.state.lock();
    if state.retry.generation == generation {
        state.retry.in_cycle = false;
    }
}
