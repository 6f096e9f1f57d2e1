#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use dds_core::{DdsOptions, Endpoint, ObserveRequest, ResourceKind, RuleObject, TransportError};
use dds_rules::Origin;
use dds_store::{channel, ConnectionStatus, PushingStatus};

fn endpoint() -> Endpoint {
    Endpoint::new("test").with_ips(["127.0.0.2"]).with_namespace("default")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eof_removes_connection() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    assert_eq!(storage.connections().len(), 1);

    client.close();
    eventually(|| storage.connections().is_empty()).await;
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    client.disconnected().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recv_error_tears_down_once() {
    let storage = storage();
    let (fake, script) = FakeTransport::new();
    let conn = storage.connected(endpoint(), fake.clone());
    script.send(Err(TransportError::Recv("reset by peer".into()))).unwrap();

    eventually(|| conn.status() == ConnectionStatus::Disconnected).await;
    assert!(storage.connections().is_empty());
    storage.disconnect(&conn);
    assert_eq!(fake.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_types_are_ignored_without_closing() {
    let storage = storage();
    let (server, client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));

    client.request(ObserveRequest { kind: "test".into(), nonce: String::new() }).await.unwrap();
    client.request(ObserveRequest::default()).await.unwrap();
    client.request(ObserveRequest { kind: "test".into(), nonce: "1".into() }).await.unwrap();
    client.subscribe(ResourceKind::TagRoute).await.unwrap();

    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;
    assert_eq!(conn.listened(), vec![ResourceKind::TagRoute]);
    assert_eq!(conn.status(), ConnectionStatus::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_for_unsubscribed_kind_is_ignored() {
    let storage = storage();
    let (server, client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));

    client.ack(ResourceKind::TagRoute, "1").await.unwrap();
    client.subscribe(ResourceKind::ConditionRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::ConditionRoute)).await;
    assert!(conn.client_status(ResourceKind::TagRoute).is_none());
    assert_eq!(conn.status(), ConnectionStatus::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_then_change_then_ack() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));

    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;
    let status = conn.client_status(ResourceKind::TagRoute).unwrap();
    assert_eq!(status.acked_revision(), -1);
    no_push(&mut client).await;

    storage.publish(tag_route(1, false));
    let push = next_push(&mut client).await;
    assert_eq!(push.kind, "dubbo.apache.org/v1alpha1/TagRoute");
    assert_eq!(push.revision, 1);
    assert_eq!(push.nonce, "1");
    let item: serde_json::Value = serde_json::from_slice(&push.data[0]).unwrap();
    assert_eq!(item["key"], "demo/default");
    assert_eq!(conn.client_status(ResourceKind::TagRoute).unwrap().pushing_status, PushingStatus::Pushing);

    client.ack(ResourceKind::TagRoute, "1").await.unwrap();
    eventually(|| conn.client_status(ResourceKind::TagRoute).unwrap().pushing_status == PushingStatus::Pushed).await;
    assert_eq!(conn.client_status(ResourceKind::TagRoute).unwrap().acked_revision(), 1);

    // Same data at a higher revision, then the same revision again: both skipped.
    storage.publish(tag_route(2, false));
    storage.publish(tag_route(1, true));
    storage.publish(tag_route(3, true));
    let push = next_push(&mut client).await;
    assert_eq!(push.revision, 3);
    assert_eq!(push.nonce, "2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_snapshot_is_pushed_on_subscribe() {
    let storage = storage();
    storage.publish(tag_route(4, false));
    let (server, mut client) = channel(8);
    let _conn = storage.connected(endpoint(), Arc::new(server));

    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    let push = next_push(&mut client).await;
    assert_eq!(push.revision, 4);
    assert_eq!(push.nonce, "1");

    // Re-subscribing does not enqueue again.
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    no_push(&mut client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_outstanding_push() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    assert_eq!(next_push(&mut client).await.nonce, "1");

    storage.publish(tag_route(2, true));
    eventually(|| conn.client_status(ResourceKind::TagRoute).unwrap().push_queued).await;
    no_push(&mut client).await;

    client.ack(ResourceKind::TagRoute, "1").await.unwrap();
    let push = next_push(&mut client).await;
    assert_eq!(push.revision, 2);
    assert_eq!(push.nonce, "2");
    assert!(!conn.client_status(ResourceKind::TagRoute).unwrap().push_queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_nonce_does_not_advance() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;
    storage.publish(tag_route(1, false));
    next_push(&mut client).await;

    client.ack(ResourceKind::TagRoute, "7").await.unwrap();
    // Ordering on the request channel: the subscribe below is handled after the bad ack.
    client.subscribe(ResourceKind::DynamicConfig).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::DynamicConfig)).await;
    let status = conn.client_status(ResourceKind::TagRoute).unwrap();
    assert_eq!(status.pushing_status, PushingStatus::Pushing);
    assert_eq!(status.acked_revision(), -1);

    client.ack(ResourceKind::TagRoute, "1").await.unwrap();
    eventually(|| conn.client_status(ResourceKind::TagRoute).unwrap().pushing_status == PushingStatus::Pushed).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacked_push_past_block_max_time_drops_connection() {
    let storage = storage_with(DdsOptions { block_max_time: Duration::from_millis(100), ..Default::default() });
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    next_push(&mut client).await;
    storage.publish(tag_route(2, true));

    eventually(|| conn.status() == ConnectionStatus::Disconnected).await;
    assert!(storage.connections().is_empty());
    client.disconnected().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lone_unacked_push_drops_connection() {
    let storage = storage_with(DdsOptions { block_max_time: Duration::from_millis(100), ..Default::default() });
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    next_push(&mut client).await;
    assert_eq!(conn.pending(), 0);

    eventually(|| conn.status() == ConnectionStatus::Disconnected).await;
    assert!(storage.connections().is_empty());
    client.disconnected().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acked_push_keeps_connection_past_block_max_time() {
    let storage = storage_with(DdsOptions { block_max_time: Duration::from_millis(100), ..Default::default() });
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    let push = next_push(&mut client).await;
    client.ack(ResourceKind::TagRoute, push.nonce).await.unwrap();
    eventually(|| conn.client_status(ResourceKind::TagRoute).unwrap().pushing_status == PushingStatus::Pushed).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(conn.status(), ConnectionStatus::Connected);
    assert_eq!(storage.connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlistened_kinds_are_dropped_in_order() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::TagRoute).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(Origin::new(
        ResourceKind::ConditionRoute,
        1,
        vec![RuleObject::new("c", "default", serde_json::json!({}))],
    ));
    storage.publish(tag_route(1, false));
    let push = next_push(&mut client).await;
    assert_eq!(push.kind, ResourceKind::TagRoute.as_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_error_skips_only_that_item() {
    let storage = storage();
    let (server, mut client) = channel(8);
    let conn = storage.connected(endpoint(), Arc::new(server));
    client.subscribe(ResourceKind::AuthenticationPolicy).await.unwrap();
    eventually(|| conn.is_listening(ResourceKind::AuthenticationPolicy)).await;

    storage.publish(Origin::new(
        ResourceKind::AuthenticationPolicy,
        1,
        vec![RuleObject::new("bad", "default", serde_json::json!({ "selector": 3 }))],
    ));
    storage.publish(Origin::new(
        ResourceKind::AuthenticationPolicy,
        2,
        vec![RuleObject::new("good", "default", serde_json::json!({ "action": "ALLOW" }))],
    ));
    let push = next_push(&mut client).await;
    assert_eq!(push.revision, 2);
    assert_eq!(push.nonce, "1");
    assert_eq!(conn.status(), ConnectionStatus::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_failure_disconnects() {
    let storage = storage();
    let (fake, script) = FakeTransport::new();
    fake.fail_sends.store(true, Ordering::SeqCst);
    let conn = storage.connected(endpoint(), fake.clone());
    script.send(Ok(ObserveRequest::subscribe(ResourceKind::TagRoute))).unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    eventually(|| conn.status() == ConnectionStatus::Disconnected).await;
    assert!(storage.connections().is_empty());
    assert_eq!(fake.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_reaches_a_disconnected_connection() {
    let storage = storage();
    let (fake, script) = FakeTransport::new();
    let conn = storage.connected(endpoint(), fake.clone());
    script.send(Ok(ObserveRequest::subscribe(ResourceKind::TagRoute))).unwrap();
    eventually(|| conn.is_listening(ResourceKind::TagRoute)).await;

    storage.disconnect(&conn);
    storage.disconnect(&conn);
    storage.publish(tag_route(1, false));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fake.sent().is_empty());
    assert_eq!(conn.pending(), 0);
    assert_eq!(fake.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(storage.latest(ResourceKind::TagRoute).map(|o| o.revision), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fake_transport_records_pushes_per_connection() {
    let storage = storage();
    let (a, script_a) = FakeTransport::new();
    let (b, script_b) = FakeTransport::new();
    let conn_a = storage.connected(endpoint(), a.clone());
    let conn_b = storage.connected(Endpoint::new("other"), b.clone());
    script_a.send(Ok(ObserveRequest::subscribe(ResourceKind::TagRoute))).unwrap();
    script_b.send(Ok(ObserveRequest::subscribe(ResourceKind::TagRoute))).unwrap();
    eventually(|| conn_a.is_listening(ResourceKind::TagRoute) && conn_b.is_listening(ResourceKind::TagRoute)).await;

    storage.publish(tag_route(1, false));
    eventually(|| a.sent().len() == 1 && b.sent().len() == 1).await;
    assert_eq!(a.sent()[0].nonce, "1");
    assert_eq!(b.sent()[0].nonce, "1");
    assert_ne!(conn_a.id(), conn_b.id());
}
