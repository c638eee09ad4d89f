//! Subscription registry behavior
//!
//! Every subscribe call is its own logical subscription with its own id;
//! the native side shares one broker subscription per topic.

mod test_helpers;

use mqtt_bridge::client::SubscribeRequest;
use mqtt_bridge::native::NativeOperation;
use mqtt_bridge::protocol::{ConnectionOptions, Qos, ReasonCode};
use mqtt_bridge::testing::NativeCall;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use test_helpers::{Harness, CLIENT_ID};

fn counting_request(topic: &str, counter: &Arc<AtomicUsize>) -> SubscribeRequest {
    let counter = Arc::clone(counter);
    SubscribeRequest::new(topic, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn test_same_topic_gets_distinct_ids() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let first_count = Arc::new(AtomicUsize::new(0));
    let second_count = Arc::new(AtomicUsize::new(0));

    let first = client.subscribe(counting_request("sensors/temp", &first_count));
    let second = client.subscribe(counting_request("sensors/temp", &second_count));

    assert_ne!(first.id(), second.id());
    assert_eq!(
        first.id().as_str(),
        format!("mqtt_client#{CLIENT_ID}#subscribe_mqtt#sensors/temp#1#1")
    );
    assert_eq!(client.subscription_count(), 2);
    assert_eq!(
        harness.native.broker_subscribed_topics(),
        vec!["sensors/temp".to_string()]
    );

    harness
        .native
        .emit_message(first.id(), "sensors/temp", "21.5", Qos::AtLeastOnce);
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 0);

    harness
        .native
        .publish(CLIENT_ID, "sensors/temp", "22.0", Qos::AtLeastOnce);
    assert_eq!(first_count.load(Ordering::SeqCst), 2);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_message_payload_reaches_callback() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let handle = client.subscribe(
        SubscribeRequest::new("alerts", move |message| sink.lock().push(message.clone()))
            .qos(Qos::ExactlyOnce),
    );
    harness
        .native
        .emit_message(handle.id(), "alerts", r#"{"level":"high"}"#, Qos::ExactlyOnce);

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, "alerts");
    assert_eq!(received[0].payload, r#"{"level":"high"}"#);
    assert_eq!(received[0].qos, Qos::ExactlyOnce);
}

#[tokio::test]
async fn test_subscribe_passes_qos_to_native() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;

    let handle = client.subscribe(SubscribeRequest::new("a/b", |_| {}).qos(Qos::AtMostOnce));

    assert!(harness.native.calls().contains(&NativeCall::Subscribe {
        subscription_id: handle.id().clone(),
        client_id: CLIENT_ID.to_string(),
        topic: "a/b".to_string(),
        qos: Qos::AtMostOnce,
    }));
    assert_eq!(handle.qos(), Qos::AtMostOnce);
    assert_eq!(handle.topic(), "a/b");
}

#[tokio::test]
async fn test_success_and_failure_callbacks() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let acks = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let ack_sink = Arc::clone(&acks);
    let failure_sink = Arc::clone(&failures);

    let handle = client.subscribe(
        SubscribeRequest::new("a/b", |_| {})
            .on_success(move |ack| ack_sink.lock().push(ack.topic.clone()))
            .on_error(move |failure| failure_sink.lock().push(failure.error_message.clone())),
    );
    harness
        .native
        .emit_subscribe_success(handle.id(), "a/b", Qos::AtLeastOnce);
    harness
        .native
        .emit_subscribe_failed(handle.id(), "not authorized");

    assert_eq!(*acks.lock(), vec!["a/b".to_string()]);
    assert_eq!(*failures.lock(), vec!["not authorized".to_string()]);
}

#[tokio::test]
async fn test_remove_releases_topic_only_after_last_subscription() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let first = client.subscribe(SubscribeRequest::new("a/b", |_| {}));
    let second = client.subscribe(SubscribeRequest::new("a/b", |_| {}));

    first.remove();
    assert!(!first.is_active());
    assert!(harness.native.broker_unsubscribed_topics().is_empty());
    assert_eq!(harness.native.subscribers(CLIENT_ID, "a/b"), vec![second.id().clone()]);

    second.remove();
    assert_eq!(
        harness.native.broker_unsubscribed_topics(),
        vec!["a/b".to_string()]
    );
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_remove_is_idempotent() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let messages = Arc::new(AtomicUsize::new(0));
    let handle = client.subscribe(counting_request("a/b", &messages));

    handle.remove();
    handle.remove();
    harness
        .native
        .emit_message(handle.id(), "a/b", "late", Qos::AtLeastOnce);

    let unsubscribes = harness
        .native
        .calls()
        .iter()
        .filter(|call| matches!(call, NativeCall::Unsubscribe { .. }))
        .count();
    assert_eq!(unsubscribes, 1);
    assert_eq!(messages.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_native_subscribe_failure_reports_subscription_error() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    harness.native.fail_operation(NativeOperation::Subscribe);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);

    let handle = client.subscribe(
        SubscribeRequest::new("a/b", |_| {}).on_error(move |failure| sink.lock().push(failure.clone())),
    );

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason_code, Some(ReasonCode::SUBSCRIPTION_ERROR));
    assert_eq!(failures[0].topic.as_deref(), Some("a/b"));
    assert!(!handle.is_active());
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_client_remove_makes_subscriptions_inert() {
    let harness = Harness::new();
    let client = harness.connected_client(ConnectionOptions::default()).await;
    let messages = Arc::new(AtomicUsize::new(0));
    let handle = client.subscribe(counting_request("a/b", &messages));

    client.remove();
    harness
        .native
        .emit_message(handle.id(), "a/b", "after remove", Qos::AtLeastOnce);
    handle.remove();

    assert!(!handle.is_active());
    assert_eq!(messages.load(Ordering::SeqCst), 0);
    assert!(!harness
        .native
        .calls()
        .iter()
        .any(|call| matches!(call, NativeCall::Unsubscribe { .. })));
    assert_eq!(harness.router.event_count(), 0);
}

#[tokio::test]
async fn test_subscribe_on_removed_client_is_inert() {
    let harness = Harness::new();
    let client = harness.client(ConnectionOptions::default()).await;
    client.remove();
    harness.native.clear_calls();

    let handle = client.subscribe(SubscribeRequest::new("a/b", |_| {}));

    assert!(!handle.is_active());
    assert!(harness.native.calls().is_empty());
}
