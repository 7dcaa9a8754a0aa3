//! Pub/sub over the in-memory transport.
//!
//! Two workers share the `workers` group and split the orders between them;
//! an auditor in its own group sees every order.
//!
//! Run with: cargo run --example pubsub_memory

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use mom_broker::{create_memory_transport, BrokerBuilder, EventMessage, PubSubBroker};

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

async fn start(name: &'static str, group: &str) -> Result<PubSubBroker> {
    // ---
    let transport = create_memory_transport(name).await?;
    let broker = BrokerBuilder::new().transport(transport).build_pubsub()?;

    broker.on("orders", move |msg: EventMessage| async move {
        let order: Order = msg.data_as()?;
        println!("{name}: order #{} ({})", order.id, order.item);
        msg.acknowledge().await
    });
    broker.subscribe(group, &["orders"]).await?;

    Ok(broker)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let brokers = vec![
        start("worker-1", "workers").await?,
        start("worker-2", "workers").await?,
        start("auditor", "audit").await?,
    ];

    let shop = BrokerBuilder::new()
        .transport(create_memory_transport("shop").await?)
        .build_pubsub()?;

    for (id, item) in ["lamp", "desk", "chair", "rug"].into_iter().enumerate() {
        let order = Order {
            id: id as u32,
            item: item.to_string(),
        };
        shop.publish("orders", &order).await?;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    for broker in brokers {
        broker.destroy().await?;
    }
    shop.destroy().await?;
    Ok(())
}
