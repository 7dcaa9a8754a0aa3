//! Request/reply over the in-memory transport.
//!
//! Run with: cargo run --example rpc_memory

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mom_broker::{create_memory_transport, BrokerBuilder, BrokerError, Result, RpcRequest};

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    sum: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = BrokerBuilder::new()
        .transport(create_memory_transport("math-server").await?)
        .build_rpc()?;

    server.on("add", |req: RpcRequest| async move {
        let AddRequest { a, b } = req.data_as()?;
        req.reply(AddResponse { sum: a + b }).await?;
        req.acknowledge().await
    });
    server.subscribe("math", &["add"]).await?;

    let client = BrokerBuilder::new()
        .transport(create_memory_transport("math-client").await?)
        .call_timeout(Duration::from_secs(2))
        .build_rpc()?;

    let resp: AddResponse = client.call("add", &AddRequest { a: 20, b: 3 }).await?;
    println!("20 + 3 = {}", resp.sum);

    // Nobody serves "mul"; the call runs into its deadline.
    match client
        .call_with_timeout::<_, AddResponse>("mul", &AddRequest { a: 2, b: 3 }, Duration::from_millis(100))
        .await
    {
        Err(BrokerError::Timeout(after)) => println!("mul timed out after {after:?}"),
        other => println!("mul: unexpected outcome {other:?}"),
    }

    client.destroy().await?;
    server.destroy().await?;
    Ok(())
}
