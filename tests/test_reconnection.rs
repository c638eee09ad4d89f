//! Automatic reconnection with exponential backoff
//!
//! Runs on a paused tokio clock so backoff timers fire deterministically.
//! `fast_reconnect` uses a 100ms base with no jitter: attempt `n` waits
//! `100ms * 2^n` (200ms, 400ms, 800ms, ...).

mod test_helpers;

use mqtt_bridge::error::BoxError;
use mqtt_bridge::protocol::{ConnectionOptions, ConnectionStatus, ReasonCode};
use mqtt_bridge::testing::{ConnectBehavior, NativeCall};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_reconnect, Harness, CLIENT_ID};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_lost_connection_schedules_retry_after_backoff() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    assert_eq!(client.retry_count(), 1);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

    sleep(Duration::from_millis(199)).await;
    assert_eq!(harness.native.connect_calls(), 1);

    sleep(Duration::from_millis(2)).await;
    assert_eq!(harness.native.connect_calls(), 2);
    assert_eq!(client.connection_status(), ConnectionStatus::Connecting);

    harness.native.emit_connected(CLIENT_ID);
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);
    assert_eq!(client.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_honored() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(Some(3))).await;
    harness
        .native
        .set_connect_behavior(ConnectBehavior::Refuse(ReasonCode::CONNECTION_ERROR));

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_secs(60)).await;

    // One application connect plus exactly three retries
    assert_eq!(harness.native.connect_calls(), 4);
    assert_eq!(client.retry_count(), 3);
    // The last refused attempt leaves the client connecting
    assert_eq!(client.connection_status(), ConnectionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_retries_until_disconnect() {
    let harness = Harness::new();
    let client = harness
        .connected_client(
            ConnectionOptions::default()
                .with_auto_reconnect(None)
                .with_backoff(10, 1, 0),
        )
        .await;
    harness
        .native
        .set_connect_behavior(ConnectBehavior::Refuse(ReasonCode::CONNECTION_ERROR));

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_secs(10)).await;
    let attempts = harness.native.connect_calls();
    assert!(attempts > 5, "expected continued retries, saw {attempts}");

    client.disconnect();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.native.connect_calls(), attempts);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_attempts() {
    let harness = Harness::new();
    let _client = harness.connected_client(fast_reconnect(None)).await;
    harness
        .native
        .set_connect_behavior(ConnectBehavior::Refuse(ReasonCode::CONNECTION_ERROR));

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);

    // Retries land at 200ms, 600ms and 1400ms
    sleep(Duration::from_millis(201)).await;
    assert_eq!(harness.native.connect_calls(), 2);
    sleep(Duration::from_millis(398)).await;
    assert_eq!(harness.native.connect_calls(), 2);
    sleep(Duration::from_millis(2)).await;
    assert_eq!(harness.native.connect_calls(), 3);
    sleep(Duration::from_millis(800)).await;
    assert_eq!(harness.native.connect_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_when_auto_reconnect_disabled() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_secs(120)).await;

    assert_eq!(harness.native.connect_calls(), 1);
    assert_eq!(client.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_application_connect_does_not_start_cycle() {
    let harness = Harness::new();
    harness
        .native
        .set_connect_behavior(ConnectBehavior::Refuse(ReasonCode::NOT_AUTHORIZED));
    let client = harness.client(fast_reconnect(None)).await;

    client.connect();
    sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.native.connect_calls(), 1);
    assert_eq!(client.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_supersedes_pending_retry() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    client.connect();
    assert_eq!(client.retry_count(), 0);
    assert_eq!(harness.native.connect_calls(), 2);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.native.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_remove_cancels_pending_retry() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    client.remove();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.native.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interceptor_overrides_are_merged_before_retry() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    client.set_on_reconnect_interceptor(move |reason| {
        sink.lock().push(reason);
        async {
            Ok::<_, BoxError>(Some(
                ConnectionOptions::default().with_credentials("rotated", "token-2"),
            ))
        }
    });

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::NOT_AUTHORIZED);
    sleep(Duration::from_millis(250)).await;

    assert_eq!(*reasons.lock(), vec![Some(ReasonCode::NOT_AUTHORIZED)]);
    let last_connect = harness
        .native
        .calls()
        .into_iter()
        .rev()
        .find_map(|call| match call {
            NativeCall::Connect { options, .. } => Some(options),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_connect.username, "rotated");
    assert_eq!(last_connect.password, "token-2");
    assert_eq!(client.options().auto_reconnect, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_interceptor_failure_abandons_cycle() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    client.set_on_reconnect_interceptor(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Option<ConnectionOptions>, BoxError>("credential store offline".into()) }
    });

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.native.connect_calls(), 1);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_interceptor_abandons_cycle() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    client.set_on_reconnect_interceptor(move |_| {
        let crashed = counter.fetch_add(1, Ordering::SeqCst) < usize::MAX;
        async move {
            if crashed {
                panic!("credential refresh crashed");
            }
            Ok::<Option<ConnectionOptions>, BoxError>(None)
        }
    });

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.native.connect_calls(), 1);
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

    // The runtime survives and the client is still usable
    client.connect();
    harness.native.emit_connected(CLIENT_ID);
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);
    assert_eq!(harness.native.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_failure_does_not_consume_retry() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(Some(5))).await;
    harness
        .native
        .set_connect_behavior(ConnectBehavior::Refuse(ReasonCode::CONNECTION_ERROR));

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_millis(201)).await;
    assert_eq!(harness.native.connect_calls(), 2);
    assert_eq!(client.retry_count(), 2);

    harness
        .native
        .emit_disconnected(CLIENT_ID, ReasonCode::CONNECTION_ERROR);
    assert_eq!(client.retry_count(), 2);
    assert_eq!(client.connection_status(), ConnectionStatus::Connecting);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(harness.native.connect_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_removed_interceptor_is_not_consulted() {
    let harness = Harness::new();
    let client = harness.connected_client(fast_reconnect(None)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = client.set_on_reconnect_interceptor(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(None) }
    });
    handle.remove();

    harness.native.emit_disconnected(CLIENT_ID, ReasonCode::DEFAULT);
    sleep(Duration::from_millis(250)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.native.connect_calls(), 2);
}
