// tests/rpc.rs

mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration, Instant};

use common::{init_tracing, wait_until, FaultyTransport};
use mom_broker::{
    // ---
    create_memory_transport_with_hub,
    BrokerBuilder,
    BrokerError,
    Envelope,
    MemoryHub,
    Route,
    RpcBroker,
    RpcRequest,
};

#[derive(Debug, Serialize, Deserialize)]
struct QuoteRequest {
    sku: String,
    quantity: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Quote {
    sku: String,
    total_cents: u64,
}

async fn rpc(hub: &Arc<MemoryHub>, id: &str) -> RpcBroker {
    // ---
    let transport = create_memory_transport_with_hub(id, hub.clone())
        .await
        .expect("memory transport");
    BrokerBuilder::new()
        .transport(transport)
        .build_rpc()
        .expect("rpc broker")
}

/// A responder answering `ping` with `"pong"` after `delay`.
async fn pong_server(hub: &Arc<MemoryHub>, delay: Duration) -> RpcBroker {
    // ---
    let server = rpc(hub, "pong-server").await;
    server.on("ping", move |req: RpcRequest| async move {
        sleep(delay).await;
        req.reply("pong").await?;
        req.acknowledge().await
    });
    server.subscribe("pong", &["ping"]).await.unwrap();
    server
}

#[tokio::test]
async fn call_resolves_with_the_reply() {
    // ---
    // Arrange
    // ---
    init_tracing();
    let hub = MemoryHub::new();
    let _server = pong_server(&hub, Duration::from_millis(10)).await;
    let client = rpc(&hub, "client").await;

    // ---
    // Act
    // ---
    let reply: String = client.call("ping", &json!({})).await.unwrap();

    // ---
    // Assert
    // ---
    assert_eq!(reply, "pong");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn typed_request_and_response() {
    // ---
    let hub = MemoryHub::new();
    let server = rpc(&hub, "pricing").await;
    let client = rpc(&hub, "shop").await;

    server.on("quote", |req: RpcRequest| async move {
        let ask: QuoteRequest = req.data_as()?;
        let quote = Quote {
            total_cents: 250 * u64::from(ask.quantity),
            sku: ask.sku,
        };
        req.reply(&quote).await?;
        req.acknowledge().await
    });
    server.subscribe("pricing", &["quote"]).await.unwrap();

    let quote: Quote = client
        .call(
            "quote",
            &QuoteRequest {
                sku: "A-1".into(),
                quantity: 4,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        quote,
        Quote {
            sku: "A-1".into(),
            total_cents: 1000
        }
    );
}

#[tokio::test]
async fn call_without_responder_times_out_and_cleans_up() {
    // ---
    let hub = MemoryHub::new();
    let client = rpc(&hub, "client").await;
    let baseline = hub.destination_count();

    let started = Instant::now();
    let err = client
        .call_with_timeout::<_, Value>("ping", &json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_calls(), 0);
    assert!(wait_until(Duration::from_secs(1), || hub.destination_count() == baseline).await);
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    // ---
    let hub = MemoryHub::new();
    let server = rpc(&hub, "math").await;
    let client = rpc(&hub, "client").await;

    server.on("double", |req: RpcRequest| async move {
        let n: u64 = req.data_as()?;
        req.reply(n * 2).await?;
        req.acknowledge().await
    });
    server.subscribe("math", &["double"]).await.unwrap();

    let calls = (0..16u64).map(|n| {
        let client = client.clone();
        async move { client.call::<_, u64>("double", &n).await }
    });
    let results = join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), n as u64 * 2);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn late_reply_is_dropped_silently() {
    // ---
    let hub = MemoryHub::new();
    let server = pong_server(&hub, Duration::from_millis(80)).await;
    let client = rpc(&hub, "client").await;
    let mut client_errors = client.errors();
    let mut server_errors = server.errors();

    let err = client
        .call_with_timeout::<_, String>("ping", &json!({}), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)));

    // let the reply arrive after the deadline
    sleep(Duration::from_millis(120)).await;

    assert_eq!(client.pending_calls(), 0);
    assert!(client_errors.try_recv().is_err());
    assert!(server_errors.try_recv().is_err());
}

#[tokio::test]
async fn only_the_first_reply_counts() {
    // ---
    let hub = MemoryHub::new();
    let server = rpc(&hub, "server").await;
    let client = rpc(&hub, "client").await;

    server.on("who", |req: RpcRequest| async move { req.reply("first").await });
    server.on("who", |req: RpcRequest| async move {
        req.reply("second").await?;
        req.acknowledge().await
    });
    server.subscribe("svc", &["who"]).await.unwrap();

    let reply: String = client.call("who", &()).await.unwrap();
    assert_eq!(reply, "first");
}

#[tokio::test]
async fn publish_failure_fails_the_call_immediately() {
    // ---
    let hub = MemoryHub::new();
    let inner = create_memory_transport_with_hub("client", hub.clone()).await.unwrap();
    let (transport, faults) = FaultyTransport::wrap(inner);
    let client = BrokerBuilder::new().transport(transport).build_rpc().unwrap();
    let baseline = hub.destination_count();

    faults.publish.store(true, std::sync::atomic::Ordering::SeqCst);

    let started = Instant::now();
    let err = client
        .call::<_, Value>("ping", &json!({}))
        .await
        .unwrap_err();

    assert!(err.is_transport());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_calls(), 0);
    assert!(wait_until(Duration::from_secs(1), || hub.destination_count() == baseline).await);
}

#[tokio::test]
async fn provision_failure_fails_the_call() {
    // ---
    let hub = MemoryHub::new();
    let inner = create_memory_transport_with_hub("client", hub).await.unwrap();
    let (transport, faults) = FaultyTransport::wrap(inner);
    let client = BrokerBuilder::new().transport(transport).build_rpc().unwrap();

    faults.provision.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = client.call::<_, Value>("ping", &json!({})).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn destroy_rejects_calls_in_flight() {
    // ---
    let hub = MemoryHub::new();
    let client = rpc(&hub, "client").await;

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("ping", &json!({})).await })
    };

    assert!(wait_until(Duration::from_secs(1), || client.pending_calls() == 1).await);
    client.destroy().await.unwrap();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Destroyed));
    assert_eq!(client.pending_calls(), 0);

    let err = client.call::<_, Value>("ping", &json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::Destroyed));
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn request_without_reply_destination_cannot_be_answered() {
    // ---
    let hub = MemoryHub::new();
    let server = rpc(&hub, "server").await;
    let outcome = Arc::new(Mutex::new(None));

    let record = outcome.clone();
    server.on("ping", move |req: RpcRequest| {
        let record = record.clone();
        async move {
            let replied = req.reply("pong").await;
            *record.lock().unwrap() = Some(matches!(replied, Err(BrokerError::MissingReplyTo)));
            req.acknowledge().await
        }
    });
    server.subscribe("pong", &["ping"]).await.unwrap();

    let raw = create_memory_transport_with_hub("raw", hub.clone()).await.unwrap();
    let env = Envelope::event(Bytes::from_static(b"{}"), Arc::from("application/json"));
    raw.publish(Route::exchange("mom.rpc", "ping"), env).await.unwrap();

    assert!(wait_until(Duration::from_secs(1), || outcome.lock().unwrap().is_some()).await);
    assert_eq!(*outcome.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn responder_failure_is_reported_and_caller_times_out() {
    // ---
    let hub = MemoryHub::new();
    let server = rpc(&hub, "server").await;
    let client = rpc(&hub, "client").await;
    let mut errors = server.errors();

    server.on("ping", |_req: RpcRequest| async move {
        Err::<(), _>(BrokerError::handler("ping", "database offline"))
    });
    server.subscribe("pong", &["ping"]).await.unwrap();

    let err = client
        .call_with_timeout::<_, Value>("ping", &json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)));

    let report = errors.recv().await.unwrap();
    assert!(matches!(&*report, BrokerError::Handler { event, .. } if event == "ping"));
}

#[tokio::test]
async fn call_without_exchange_reaches_the_responder() {
    // ---
    let hub = MemoryHub::new();
    let direct = |id: &'static str| {
        let hub = hub.clone();
        async move {
            let transport = create_memory_transport_with_hub(id, hub).await.unwrap();
            BrokerBuilder::new()
                .transport(transport)
                .no_exchange()
                .build_rpc()
                .unwrap()
        }
    };
    let server = direct("server").await;
    let client = direct("client").await;

    server.on("ping", |req: RpcRequest| async move {
        req.reply("pong").await?;
        req.acknowledge().await
    });
    server.subscribe("pong", &["ping"]).await.unwrap();

    let reply: String = client
        .call_with_timeout("ping", &"x", Duration::from_millis(500))
        .await
        .unwrap();

    assert_eq!(reply, "pong");
    assert_eq!(client.pending_calls(), 0);
}
