// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, Duration, Instant};

use mom_broker::{
    // ---
    Address,
    BrokerError,
    DeliveryTag,
    DestinationOptions,
    Envelope,
    Result,
    Route,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Install a log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    // ---
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(2)).await;
    }
}

/// Switches that make a [`FaultyTransport`] fail on demand.
#[derive(Default)]
pub struct Faults {
    pub provision: AtomicBool,
    pub publish: AtomicBool,
    pub acknowledge: AtomicBool,
    /// Fail provisioning of one specific destination name.
    pub provision_name: std::sync::Mutex<Option<String>>,
    pub publishes: AtomicUsize,
}

/// Wraps a transport and injects failures controlled by [`Faults`].
pub struct FaultyTransport {
    inner: TransportPtr,
    faults: Arc<Faults>,
}

impl FaultyTransport {
    pub fn wrap(inner: TransportPtr) -> (TransportPtr, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        let transport = Arc::new(Self {
            inner,
            faults: faults.clone(),
        });
        (transport, faults)
    }
}

fn injected(what: &str) -> BrokerError {
    BrokerError::Transport(format!("injected {what} failure"))
}

#[async_trait::async_trait]
impl Transport for FaultyTransport {
    // ---
    fn transport_id(&self) -> &str {
        self.inner.transport_id()
    }

    async fn provision(&self, name: &str, opts: DestinationOptions) -> Result<Address> {
        // ---
        if self.faults.provision.load(Ordering::SeqCst) {
            return Err(injected("provision"));
        }
        let blocked = self.faults.provision_name.lock().unwrap().clone();
        if blocked.as_deref() == Some(name) {
            return Err(injected("provision"));
        }
        self.inner.provision(name, opts).await
    }

    async fn bind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.bind(address, exchange, routing_key).await
    }

    async fn unbind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.unbind(address, exchange, routing_key).await
    }

    async fn publish(&self, route: Route, env: Envelope) -> Result<()> {
        // ---
        if self.faults.publish.load(Ordering::SeqCst) {
            return Err(injected("publish"));
        }
        self.faults.publishes.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(route, env).await
    }

    async fn consume(&self, address: &Address) -> Result<SubscriptionHandle> {
        self.inner.consume(address).await
    }

    async fn acknowledge(&self, tag: DeliveryTag) -> Result<()> {
        // ---
        if self.faults.acknowledge.load(Ordering::SeqCst) {
            return Err(injected("acknowledge"));
        }
        self.inner.acknowledge(tag).await
    }

    async fn release(&self, address: &Address) -> Result<()> {
        self.inner.release(address).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
