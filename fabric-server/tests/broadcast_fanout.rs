//! End-to-end coverage of request -> dispatch -> broadcast, wired the same way
//! `connection::handle_request_frame` wires them, but driven directly against the
//! dispatcher and channel broker so no live socket or Redis instance is needed.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use fabric_common::protocol::ClientRequest;
use fabric_server::dispatcher;
use fabric_server::storage::fake::FakeStorageAdapter;
use fabric_server::ChannelBroker;

async fn joined_channel(broker: &ChannelBroker, channel_id: &str, connection_id: u64) -> mpsc::UnboundedReceiver<fabric_common::protocol::EventFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    broker.join(channel_id, connection_id, tx).await;
    rx
}

/// Three connections share one channel; a `set` from one reaches the other two and
/// never echoes back to the sender.
#[tokio::test]
async fn set_from_one_client_reaches_the_other_two_in_the_channel() {
    let log = fabric_common::logging::init("test");
    let adapter = FakeStorageAdapter::new();
    let broker = ChannelBroker::new(log);

    let mut rx_a = joined_channel(&broker, "chan_1", 1).await;
    let mut rx_b = joined_channel(&broker, "chan_1", 2).await;
    let mut rx_c = joined_channel(&broker, "chan_1", 3).await;

    let request = ClientRequest::Set {
        id: "req_1".into(),
        collection: "widgets".into(),
        key: "w1".into(),
        value: json!({"color": "red"}),
    };
    let outcome = dispatcher::dispatch_storage(request, &adapter).await;
    assert!(outcome.response.error.is_none());
    let event = outcome.broadcast.expect("a successful set must produce a broadcast event");
    broker.broadcast("chan_1", event.clone(), Some(1)).await;

    assert_eq!(rx_b.recv().await, Some(event.clone()));
    assert_eq!(rx_c.recv().await, Some(event));
    assert!(rx_a.try_recv().is_err(), "the originator must not receive its own broadcast");
}

/// A `set` that fails schema validation produces no broadcast, so a channel's other
/// members observe nothing.
#[tokio::test]
async fn schema_rejected_set_never_reaches_channel_members() {
    let log = fabric_common::logging::init("test");
    let adapter = FakeStorageAdapter::new();
    adapter.register_schema(
        "widgets",
        "w1",
        Arc::new(|v: &serde_json::Value| v.get("color").and_then(serde_json::Value::as_str).is_some()),
    );
    let broker = ChannelBroker::new(log);

    let mut rx_b = joined_channel(&broker, "chan_2", 2).await;

    let request = ClientRequest::Set {
        id: "req_1".into(),
        collection: "widgets".into(),
        key: "w1".into(),
        value: json!({"color": 7}),
    };
    let outcome = dispatcher::dispatch_storage(request, &adapter).await;
    assert!(outcome.response.error.is_some());
    assert!(outcome.broadcast.is_none());

    assert!(rx_b.try_recv().is_err(), "no event should have been broadcast");
    assert_eq!(adapter.has("widgets", "w1").await.unwrap(), false);
}

/// A `delete` of a key only one of two tenants could see still only reaches members of
/// that tenant's own channel -- channels are per-token, not global.
#[tokio::test]
async fn broadcast_is_scoped_to_the_originators_channel() {
    let log = fabric_common::logging::init("test");
    let adapter = FakeStorageAdapter::new();
    adapter.set("widgets", "w1", json!({"color": "blue"})).await.unwrap();
    let broker = ChannelBroker::new(log);

    let mut rx_same_channel = joined_channel(&broker, "chan_3", 20).await;
    let mut rx_other_channel = joined_channel(&broker, "chan_4", 30).await;

    let request = ClientRequest::Delete { id: "req_2".into(), collection: "widgets".into(), key: "w1".into() };
    let outcome = dispatcher::dispatch_storage(request, &adapter).await;
    let event = outcome.broadcast.expect("deleting an existing key must broadcast");
    broker.broadcast("chan_3", event.clone(), Some(10)).await;

    assert_eq!(rx_same_channel.recv().await, Some(event));
    assert!(rx_other_channel.try_recv().is_err());
}
