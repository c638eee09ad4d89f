//! Event router: keyed listener registry with fault-isolated dispatch
//!
//! The native layer emits notifications by flat event name; clients and
//! subscriptions register listeners by structured [`EventKey`]. Dispatch
//! snapshots the handler list, drops the lock, then calls each handler inside
//! its own `catch_unwind`, so a panicking or self-removing handler never
//! affects the others.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::observability::metrics;
use crate::protocol::{EventKey, EventKind, EventPayload};

type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;
type ListenerTable = RwLock<HashMap<String, Vec<Listener>>>;

struct Listener {
    id: u64,
    kind: Option<EventKind>,
    active: Arc<AtomicBool>,
    handler: Handler,
}

static GLOBAL_ROUTER: Lazy<Arc<EventRouter>> = Lazy::new(|| Arc::new(EventRouter::new()));

/// Process-wide listener registry
pub struct EventRouter {
    table: Arc<ListenerTable>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Shared router used by [`create_client`](crate::client::create_client)
    pub fn global() -> Arc<EventRouter> {
        Arc::clone(&GLOBAL_ROUTER)
    }

    /// Register a listener; it stays active until its handle is removed
    pub fn add_listener<F>(&self, key: &EventKey, handler: F) -> ListenerHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.insert(key.event_name(), Some(key.kind), Arc::new(handler))
    }

    /// Register a listener by flat event name (native boundary)
    pub fn add_raw_listener<F>(&self, event_name: &str, handler: F) -> ListenerHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.insert(event_name.to_string(), None, Arc::new(handler))
    }

    fn insert(&self, name: String, kind: Option<EventKind>, handler: Handler) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.table.write().entry(name.clone()).or_default().push(Listener {
            id,
            kind,
            active: Arc::clone(&active),
            handler,
        });
        trace!(event = %name, listener_id = id, "Listener registered");

        ListenerHandle {
            id,
            event_name: name,
            active,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Drop every listener of an event; a no-op when none exist
    pub fn remove_all_listeners(&self, key: &EventKey) {
        self.remove_all_raw(&key.event_name());
    }

    pub fn remove_all_raw(&self, event_name: &str) {
        if let Some(listeners) = self.table.write().remove(event_name) {
            for listener in listeners {
                listener.active.store(false, Ordering::Release);
            }
        }
    }

    /// Deliver a payload to all listeners of `key`; returns how many ran
    pub fn emit(&self, key: &EventKey, payload: &EventPayload) -> usize {
        self.emit_raw(&key.event_name(), payload)
    }

    /// Deliver by flat event name, as the native layer does
    pub fn emit_raw(&self, event_name: &str, payload: &EventPayload) -> usize {
        let snapshot: Vec<(u64, Option<EventKind>, Arc<AtomicBool>, Handler)> = {
            let table = self.table.read();
            match table.get(event_name) {
                Some(listeners) => listeners
                    .iter()
                    .map(|l| (l.id, l.kind, Arc::clone(&l.active), Arc::clone(&l.handler)))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut kind = None;
        for (id, listener_kind, active, handler) in snapshot {
            // Removed by an earlier handler of this same dispatch
            if !active.load(Ordering::Acquire) {
                continue;
            }
            kind = kind.or(listener_kind);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(payload)));
            match outcome {
                Ok(()) => delivered += 1,
                Err(cause) => {
                    metrics().handler_panicked();
                    error!(
                        event = %event_name,
                        listener_id = id,
                        panic = %panic_message(cause.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }

        if delivered > 0 {
            metrics().event_delivered(kind, delivered);
        }
        delivered
    }

    pub fn listener_count(&self, key: &EventKey) -> usize {
        self.listener_count_raw(&key.event_name())
    }

    pub fn listener_count_raw(&self, event_name: &str) -> usize {
        self.table
            .read()
            .get(event_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of distinct event names with at least one listener
    pub fn event_count(&self) -> usize {
        self.table.read().len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("event_count", &self.event_count())
            .finish()
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to one registered listener
///
/// Removal is idempotent and safe from inside the listener itself. Dropping
/// the handle does not remove the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    event_name: String,
    active: Arc<AtomicBool>,
    table: Weak<ListenerTable>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn remove(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };

        let mut table = table.write();
        if let Some(listeners) = table.get_mut(&self.event_name) {
            listeners.retain(|l| l.id != self.id);
            if listeners.is_empty() {
                table.remove(&self.event_name);
            }
        }
    }
}
