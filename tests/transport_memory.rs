// tests/transport_memory.rs

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use mom_broker::{
    // ---
    create_memory_transport_with_hub,
    Address,
    CorrelationId,
    DestinationOptions,
    Envelope,
    MemoryHub,
    Route,
};

fn json_event(body: &'static str) -> Envelope {
    Envelope::event(Bytes::from_static(body.as_bytes()), Arc::from("application/json"))
}

#[tokio::test]
async fn memory_consume_then_publish_direct_delivers() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub("mstpd", hub.clone())
        .await
        .expect("failed to create memory transport");

    let address = transport
        .provision("test.address", DestinationOptions::shared())
        .await
        .expect("provision failed");

    let mut sub = transport.consume(&address).await.expect("consume failed");

    let payload = Bytes::from_static(b"hello");
    let correlation_id = CorrelationId::generate();
    let env = Envelope::request(
        payload.clone(),
        correlation_id.to_arc(),
        Address::from("reply.tbd"),
        Arc::from("application/json"),
    );

    // ---
    // Act
    // ---
    transport
        .publish(Route::Direct(address.clone()), env)
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription channel closed unexpectedly");

    assert_eq!(received.payload, payload);
    assert_eq!(received.correlation_id.as_deref(), Some(correlation_id.as_str()));
    assert_eq!(received.reply_to, Some(Address::from("reply.tbd")));
    assert!(received.delivery_tag.is_some());
    assert_eq!(hub.unacked_count(), 1);

    transport
        .acknowledge(received.delivery_tag.unwrap())
        .await
        .expect("acknowledge failed");
    assert_eq!(hub.unacked_count(), 0);
}

#[tokio::test]
async fn memory_exchange_routes_by_key_to_every_bound_destination() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub("fanout", hub.clone()).await.unwrap();

    let workers = transport
        .provision("workers_orders", DestinationOptions::shared())
        .await
        .unwrap();
    let audit = transport
        .provision("audit_orders", DestinationOptions::shared())
        .await
        .unwrap();
    transport.bind(&workers, "shop", "orders").await.unwrap();
    transport.bind(&audit, "shop", "orders").await.unwrap();

    let mut workers_sub = transport.consume(&workers).await.unwrap();
    let mut audit_sub = transport.consume(&audit).await.unwrap();

    transport
        .publish(Route::exchange("shop", "orders"), json_event("1"))
        .await
        .unwrap();
    transport
        .publish(Route::exchange("shop", "refunds"), json_event("2"))
        .await
        .unwrap();

    let w = workers_sub.inbox.recv().await.unwrap();
    let a = audit_sub.inbox.recv().await.unwrap();
    assert_eq!(w.payload, Bytes::from_static(b"1"));
    assert_eq!(a.payload, Bytes::from_static(b"1"));
    assert_eq!(w.routing_key.as_deref(), Some("orders"));

    // nothing is bound for "refunds"
    assert!(workers_sub.inbox.try_recv().is_err());
    assert!(audit_sub.inbox.try_recv().is_err());
}

#[tokio::test]
async fn memory_ephemeral_destinations_get_unique_names_and_release_ends_consumers() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub("rpc", hub.clone()).await.unwrap();

    let first = transport
        .provision("", DestinationOptions::ephemeral())
        .await
        .unwrap();
    let second = transport
        .provision("", DestinationOptions::ephemeral())
        .await
        .unwrap();
    assert_ne!(first, second);

    let mut sub = transport.consume(&first).await.unwrap();
    transport.release(&first).await.unwrap();

    assert!(!hub.destination_exists(first.as_str()));
    let ended = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("inbox should end after release");
    assert!(ended.is_none());
}
