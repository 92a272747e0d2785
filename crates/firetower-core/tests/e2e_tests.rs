//! End-to-end tests: JSON clients through the gateway and a mock topic service.

use std::time::Duration;

use firetower_core::network::message::kinds;
use firetower_core::testing::{eventually, GatewayTestHarness, TestHarnessBuilder, TEST_TIMEOUT};
use firetower_core::LinkState;
use serde_json::json;

const QUIET: Duration = Duration::from_millis(200);

#[tokio::test]
async fn test_publish_roundtrip_between_clients() {
    let mut harness = GatewayTestHarness::new().await;
    let mut alice = harness.connect_client().await;
    let mut bob = harness.connect_client().await;

    bob.subscribe("room").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().subscriber_count("room") == 1).await);

    alice.publish("room", json!({"text": "hello"})).await;

    let event = bob.recv(TEST_TIMEOUT).await.expect("bob receives");
    assert_eq!(event.kind, "publish");
    assert_eq!(event.topic, "room");
    assert_eq!(event.data, json!({"text": "hello"}));

    // The publisher is not subscribed and gets nothing back.
    assert!(alice.recv(QUIET).await.is_none());

    let calls = harness.service.get_calls_for_topic("room").await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, "user");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_service_broadcast_reaches_subscribers() {
    let mut harness = GatewayTestHarness::new().await;
    let mut client = harness.connect_client().await;

    client.subscribe("a,b").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().topic_count() == 2).await);

    harness.service.broadcast(kinds::PUBLISH, "b", b"from platform");
    let event = client.recv(TEST_TIMEOUT).await.unwrap();
    assert_eq!(event.topic, "b");
    assert_eq!(event.data, json!("from platform"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let mut harness = GatewayTestHarness::new().await;
    let mut client = harness.connect_client().await;

    client.subscribe("room").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().subscriber_count("room") == 1).await);
    client.unsubscribe("room").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().topic_count() == 0).await);

    harness.service.broadcast(kinds::PUBLISH, "room", b"late");
    assert!(client.recv(QUIET).await.is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hot_topic_is_sharded() {
    let mut harness = TestHarnessBuilder::new()
        .hot_topic("live")
        .shard_count(4)
        .build()
        .await;
    let mut client = harness.connect_client().await;

    client.subscribe("live").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().topic_count() == 1).await);
    assert_eq!(harness.manager.bucket().subscriber_count("live"), 0);

    let session_id = harness.manager.session_ids().pop().expect("one session");
    let session = harness.manager.session(&session_id).unwrap();
    let shard_topic = session.topics().pop().expect("one topic");
    assert!(shard_topic.starts_with("live_"));

    harness.service.broadcast(kinds::PUBLISH, &shard_topic, b"shard message");
    let event = client.recv(TEST_TIMEOUT).await.unwrap();
    assert_eq!(event.topic, shard_topic);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_offline_user_disconnects_client() {
    let mut harness = GatewayTestHarness::new().await;
    let mut client = harness.connect_client().await;

    client.subscribe("room").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().subscriber_count("room") == 1).await);
    let session_id = harness.manager.bucket().subscribers("room")[0].id().to_string();

    harness
        .service
        .broadcast(kinds::OFFLINE_USER, "room", session_id.as_bytes());

    assert!(eventually(TEST_TIMEOUT, || harness.manager.session_count() == 0).await);
    // Connection closed by the gateway.
    assert!(client.recv(TEST_TIMEOUT).await.is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_delivery_resumes_after_upstream_reconnect() {
    let mut harness = GatewayTestHarness::new().await;
    let mut client = harness.connect_client().await;
    client.subscribe("room").await;
    assert!(eventually(TEST_TIMEOUT, || harness.manager.bucket().subscriber_count("room") == 1).await);

    let metrics = std::sync::Arc::clone(&harness.manager.context().metrics);
    harness.service.drop_connections();
    assert!(eventually(TEST_TIMEOUT, || metrics.upstream_reconnects.get() >= 1.0).await);
    assert_eq!(harness.manager.link_state(), LinkState::Connected);
    assert!(harness.service.wait_for_connections(1, TEST_TIMEOUT).await);

    harness.service.broadcast(kinds::PUBLISH, "room", b"after reconnect");
    let event = client.recv(TEST_TIMEOUT).await.unwrap();
    assert_eq!(event.data, json!("after reconnect"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_publish_error_reported_when_upstream_down() {
    let mut harness = TestHarnessBuilder::new().backoff(5_000, 5_000).build().await;
    let mut client = harness.connect_client().await;

    harness.service.stop();
    assert!(
        eventually(TEST_TIMEOUT, || harness.manager.link_state() == LinkState::Reconnecting).await
    );

    client.publish("room", json!("hi")).await;
    let event = client.recv(TEST_TIMEOUT).await.unwrap();
    assert_eq!(event.kind, "error");
    assert_eq!(event.topic, "room");

    harness.shutdown().await;
}
