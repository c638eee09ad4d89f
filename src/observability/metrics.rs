//! Thread-safe metrics collection
//!
//! Atomic counters for client lifecycle, reconnection and event dispatch,
//! plus a mutex-protected per-kind breakdown of delivered events.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::EventKind;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Client lifecycle
    clients_created: AtomicU64,
    client_init_failures: AtomicU64,
    clients_removed: AtomicU64,

    // Connection metrics
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    unexpected_disconnections: AtomicU64,
    reconnects_scheduled: AtomicU64,
    reconnects_abandoned: AtomicU64,
    last_connected_at: AtomicU64,

    // Dispatch metrics
    events_delivered: AtomicU64,
    handler_panics: AtomicU64,
    active_subscriptions: AtomicU64,
    events_by_kind: Mutex<HashMap<&'static str, u64>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            clients_created: AtomicU64::new(0),
            client_init_failures: AtomicU64::new(0),
            clients_removed: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            unexpected_disconnections: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            reconnects_abandoned: AtomicU64::new(0),
            last_connected_at: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            events_by_kind: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Client lifecycle
    pub fn client_created(&self) {
        self.clients_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_init_failed(&self) {
        self.client_init_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_removed(&self) {
        self.clients_removed.fetch_add(1, Ordering::Relaxed);
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.unexpected_disconnections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_abandoned(&self) {
        self.reconnects_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    // Dispatch metrics
    pub fn event_delivered(&self, kind: Option<EventKind>, handlers: usize) {
        self.events_delivered
            .fetch_add(handlers as u64, Ordering::Relaxed);
        let label = kind.map(kind_label).unwrap_or("native");
        if let Ok(mut by_kind) = self.events_by_kind.lock() {
            *by_kind.entry(label).or_insert(0) += handlers as u64;
        }
    }

    pub fn handler_panicked(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_added(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_released(&self) {
        // Saturate at zero; releases racing a reset must not wrap around.
        let _ = self.active_subscriptions.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |current| Some(current.saturating_sub(1)),
        );
    }

    pub fn reset(&self) {
        for counter in [
            &self.clients_created,
            &self.client_init_failures,
            &self.clients_removed,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.unexpected_disconnections,
            &self.reconnects_scheduled,
            &self.reconnects_abandoned,
            &self.last_connected_at,
            &self.events_delivered,
            &self.handler_panics,
            &self.active_subscriptions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut by_kind) = self.events_by_kind.lock() {
            by_kind.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let events_by_kind = self
            .events_by_kind
            .lock()
            .map(|by_kind| {
                by_kind
                    .iter()
                    .map(|(label, count)| (label.to_string(), *count))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            clients: ClientMetrics {
                created: self.clients_created.load(Ordering::Relaxed),
                init_failures: self.client_init_failures.load(Ordering::Relaxed),
                removed: self.clients_removed.load(Ordering::Relaxed),
            },
            connections: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                unexpected_disconnections: self
                    .unexpected_disconnections
                    .load(Ordering::Relaxed),
                reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
                reconnects_abandoned: self.reconnects_abandoned.load(Ordering::Relaxed),
                last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                delivered: self.events_delivered.load(Ordering::Relaxed),
                handler_panics: self.handler_panics.load(Ordering::Relaxed),
                active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
                by_kind: events_by_kind,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Message => "message",
        other => other.suffix(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub clients: ClientMetrics,
    pub connections: ConnectionMetrics,
    pub events: EventMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    pub created: u64,
    pub init_failures: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub unexpected_disconnections: u64,
    pub reconnects_scheduled: u64,
    pub reconnects_abandoned: u64,
    pub last_connected_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMetrics {
    pub delivered: u64,
    pub handler_panics: u64,
    pub active_subscriptions: u64,
    pub by_kind: HashMap<String, u64>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
