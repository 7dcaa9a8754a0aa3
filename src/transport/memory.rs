//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. Broker-backed transports are expected to approximate it as closely as
//! their underlying systems allow and to document any unavoidable deviations.
//!
//! - Destinations are queues. Envelopes routed to a queue with no consumer
//!   wait in its backlog until one attaches.
//! - Several consumers on one queue compete; envelopes are handed out
//!   round-robin.
//! - Exchanges are implicit: binding a queue to an exchange name creates it.
//!   A published envelope reaches every queue bound with an equal routing key.
//! - Envelopes with no route are dropped silently.
//! - Delivered envelopes stay unacknowledged until `acknowledge()` is called
//!   with their delivery tag. Nothing is redelivered.
//!
//! ## Non-Goals
//!
//! Persistence, network behavior, failure simulation, or exact emulation of
//! any specific broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
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

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Consumer {
    owner: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct Queue {
    /// Owning transport for exclusive queues.
    owner: Option<u64>,
    consumers: Vec<Consumer>,
    cursor: usize,
    backlog: VecDeque<Envelope>,
}

struct Binding {
    routing_key: Arc<str>,
    address: Address,
}

/// Prefix of server-generated destination names.
const GENERATED_PREFIX: &str = "mem.gen-";

#[derive(Default)]
struct HubState {
    queues: HashMap<Address, Queue>,
    bindings: HashMap<Arc<str>, Vec<Binding>>,
    unacked: HashMap<DeliveryTag, Address>,
    provisions: HashMap<Address, usize>,
    provisioning_now: HashMap<Address, usize>,
    provisioning_peak: HashMap<Address, usize>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All transports that
/// share a `MemoryHub` see each other's destinations and messages, exactly as
/// nodes connected to a real broker would.
///
/// The inspection methods (`provision_count`, `unacked_count`, ...) exist so
/// tests can observe what brokers did to the transport.
///
/// # Usage in Integration Tests
///
/// ```
/// # use mom_broker::MemoryHub;
/// # async fn example() -> mom_broker::Result<()> {
/// let hub = MemoryHub::new();
/// let a = mom_broker::create_memory_transport_with_hub("a", hub.clone()).await?;
/// let b = mom_broker::create_memory_transport_with_hub("b", hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    next_tag: AtomicU64,
    next_transport: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// How many times `name` has been provisioned.
    pub fn provision_count(&self, name: &str) -> usize {
        let state = lock_ignore_poison(&self.state);
        state
            .provisions
            .get(&Address::from(name))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of overlapping `provision()` calls ever observed for
    /// `name`.
    pub fn max_concurrent_provisions(&self, name: &str) -> usize {
        let state = lock_ignore_poison(&self.state);
        state
            .provisioning_peak
            .get(&Address::from(name))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_provisions(&self) -> usize {
        let state = lock_ignore_poison(&self.state);
        state.provisions.len() + state.provisioning_now.len() + state.provisioning_peak.len()
    }

    /// Number of delivered envelopes not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        lock_ignore_poison(&self.state).unacked.len()
    }

    /// Whether a destination named `name` currently exists.
    pub fn destination_exists(&self, name: &str) -> bool {
        lock_ignore_poison(&self.state)
            .queues
            .contains_key(&Address::from(name))
    }

    /// Number of destinations that currently exist.
    pub fn destination_count(&self) -> usize {
        lock_ignore_poison(&self.state).queues.len()
    }

    /// Number of live consumers attached to `name`.
    pub fn consumer_count(&self, name: &str) -> usize {
        let state = lock_ignore_poison(&self.state);
        state
            .queues
            .get(&Address::from(name))
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether `name` is bound to `exchange` with `routing_key`.
    pub fn is_bound(&self, name: &str, exchange: &str, routing_key: &str) -> bool {
        let state = lock_ignore_poison(&self.state);
        state
            .bindings
            .get(exchange)
            .map(|list| {
                list.iter()
                    .any(|b| b.address.as_str() == name && b.routing_key.as_ref() == routing_key)
            })
            .unwrap_or(false)
    }

    fn register_transport(&self) -> u64 {
        self.next_transport.fetch_add(1, Ordering::Relaxed)
    }

    fn begin_provision(&self, address: &Address) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let now = {
            let n = state.provisioning_now.entry(address.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let peak = state.provisioning_peak.entry(address.clone()).or_insert(0);
        *peak = (*peak).max(now);
    }

    fn finish_provision(&self, address: &Address, owner: u64, opts: DestinationOptions) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(n) = state.provisioning_now.get_mut(address) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.provisioning_now.remove(address);
            }
        }

        if let Some(queue) = state.queues.get(address) {
            if let Some(existing) = queue.owner {
                if existing != owner {
                    return Err(BrokerError::Transport(format!(
                        "destination {address} is exclusive to another connection"
                    )));
                }
            }
        } else {
            state.queues.insert(
                address.clone(),
                Queue {
                    owner: opts.exclusive.then_some(owner),
                    consumers: Vec::new(),
                    cursor: 0,
                    backlog: VecDeque::new(),
                },
            );
        }

        *state.provisions.entry(address.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn bind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !state.queues.contains_key(address) {
            return Err(BrokerError::Transport(format!(
                "cannot bind unknown destination {address}"
            )));
        }

        let list = state.bindings.entry(Arc::from(exchange)).or_default();
        let exists = list
            .iter()
            .any(|b| &b.address == address && b.routing_key.as_ref() == routing_key);
        if !exists {
            list.push(Binding {
                routing_key: Arc::from(routing_key),
                address: address.clone(),
            });
        }
        Ok(())
    }

    fn unbind(&self, address: &Address, exchange: &str, routing_key: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(list) = state.bindings.get_mut(exchange) {
            list.retain(|b| !(&b.address == address && b.routing_key.as_ref() == routing_key));
        }
    }

    fn publish(&self, transport_id: &str, route: Route, env: Envelope) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let (targets, routing_key): (Vec<Address>, Arc<str>) = match &route {
            Route::Exchange {
                exchange,
                routing_key,
            } => {
                let targets = state
                    .bindings
                    .get(exchange)
                    .map(|list| {
                        list.iter()
                            .filter(|b| &b.routing_key == routing_key)
                            .map(|b| b.address.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                (targets, routing_key.clone())
            }
            Route::Direct(address) => (vec![address.clone()], address.0.clone()),
        };

        if targets.is_empty() {
            log_debug!("{transport_id}: no destination bound for {route}, dropping");
            return;
        }

        for address in targets {
            let mut env = env.clone();
            env.routing_key = Some(routing_key.clone());
            if !self.deliver(&mut state, &address, env) {
                log_debug!("{transport_id}: destination {address} does not exist, dropping");
            }
        }
    }

    /// Hand an envelope to the next live consumer of `address`, or park it
    /// in the backlog. Returns false when the destination does not exist.
    fn deliver(&self, state: &mut HubState, address: &Address, mut env: Envelope) -> bool {
        // ---
        let Some(queue) = state.queues.get_mut(address) else {
            return false;
        };

        queue.consumers.retain(|c| !c.tx.is_closed());

        let count = queue.consumers.len();
        for i in 0..count {
            let idx = (queue.cursor + i) % count;
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            env.delivery_tag = Some(tag);

            match queue.consumers[idx].tx.send(env) {
                Ok(()) => {
                    queue.cursor = (idx + 1) % count;
                    state.unacked.insert(tag, address.clone());
                    return true;
                }
                Err(mpsc::error::SendError(returned)) => {
                    env = returned;
                }
            }
        }

        env.delivery_tag = None;
        queue.backlog.push_back(env);
        true
    }

    fn consume(&self, owner: u64, address: &Address) -> Result<SubscriptionHandle> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let queue = state.queues.get_mut(address).ok_or_else(|| {
            BrokerError::Transport(format!("cannot consume unknown destination {address}"))
        })?;

        if let Some(existing) = queue.owner {
            if existing != owner {
                return Err(BrokerError::Transport(format!(
                    "destination {address} is exclusive to another connection"
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(Consumer { owner, tx });

        let backlog: Vec<Envelope> = queue.backlog.drain(..).collect();
        for env in backlog {
            self.deliver(&mut state, address, env);
        }

        Ok(SubscriptionHandle {
            address: address.clone(),
            inbox: rx,
        })
    }

    fn acknowledge(&self, tag: DeliveryTag) {
        lock_ignore_poison(&self.state).unacked.remove(&tag);
    }

    fn release(&self, address: &Address) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        Self::remove_queue(&mut state, address);
    }

    fn remove_queue(state: &mut HubState, address: &Address) {
        // ---
        state.queues.remove(address);
        for list in state.bindings.values_mut() {
            list.retain(|b| &b.address != address);
        }
        state.unacked.retain(|_, a| a != address);

        // generated names are never provisioned again
        if address.as_str().starts_with(GENERATED_PREFIX) {
            state.provisions.remove(address);
            state.provisioning_now.remove(address);
            state.provisioning_peak.remove(address);
        }
    }

    fn close(&self, owner: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let owned: Vec<Address> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(owner))
            .map(|(a, _)| a.clone())
            .collect();
        for address in &owned {
            Self::remove_queue(&mut state, address);
        }

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.owner != owner);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
            next_tag: AtomicU64::new(1),
            next_transport: AtomicU64::new(1),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// One instance plays the role of one broker connection on a shared
/// [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    owner: u64,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Transport(format!(
                "{}: transport closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn provision(&self, name: &str, opts: DestinationOptions) -> Result<Address> {
        // ---
        self.ensure_open()?;

        let address = if name.is_empty() {
            Address::from(format!("{GENERATED_PREFIX}{}", Uuid::new_v4().simple()))
        } else {
            Address::from(name)
        };

        // Real brokers answer a declare asynchronously; yielding here lets
        // overlapping provisioning show up in `max_concurrent_provisions`.
        self.hub.begin_provision(&address);
        tokio::task::yield_now().await;
        self.hub.finish_provision(&address, self.owner, opts)?;

        log_debug!("{}: provisioned {address}", self.transport_id);
        Ok(address)
    }

    async fn bind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.bind(address, exchange, routing_key)
    }

    async fn unbind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.unbind(address, exchange, routing_key);
        Ok(())
    }

    async fn publish(&self, route: Route, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.hub.publish(&self.transport_id, route, env);
        Ok(())
    }

    async fn consume(&self, address: &Address) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;
        let handle = self.hub.consume(self.owner, address)?;
        log_debug!("{}: consuming {address}", self.transport_id);
        Ok(handle)
    }

    async fn acknowledge(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        self.hub.acknowledge(tag);
        Ok(())
    }

    async fn release(&self, address: &Address) -> Result<()> {
        self.ensure_open()?;
        self.hub.release(address);
        Ok(())
    }

    /// Close the transport.
    ///
    /// Ends every consumer this transport opened and deletes its exclusive
    /// destinations. Other transports on the same hub are unaffected.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log_debug!("{}: closing transport", self.transport_id);
        self.hub.close(self.owner);
        Ok(())
    }
}

/// Create an in-memory transport on the process-global hub.
///
/// All transports created with this function share a single message bus.
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(transport_id: impl Into<String>) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(transport_id, global_hub()).await
}

/// Create an in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport_with_hub(
    transport_id: impl Into<String>,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    let transport_id = transport_id.into();
    log_debug!("{transport_id}: create memory transport");

    let transport = MemoryTransport {
        transport_id,
        owner: hub.register_transport(),
        hub,
        closed: AtomicBool::new(false),
    };

    Ok(Arc::new(transport))
}
