//! Subscription registry.
//!
//! Tracks which `(group, event)` pairs a broker has subscribed and which
//! destinations already have a consumption loop. All changes go through one
//! async mutex that is held across the transport calls, so two overlapping
//! `subscribe` calls never provision the same destination at the same time
//! and never start a second loop for it.
//!
//! With an exchange, each `(group, event)` pair is consumed from
//! `"{group}_{event}"` and routed by binding. Unsubscribing removes the
//! binding but leaves the loop running; those loops are only stopped by
//! [`SubscriptionRegistry::shutdown`].
//!
//! Without an exchange, publishers send straight to the destination named
//! after the event, so subscribers consume that destination and every
//! subscriber of the event competes for its messages regardless of group.
//! Unsubscribing then stops the loop, since there is no binding to remove.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_info,
    Address,
    BrokerError,
    DestinationOptions,
    Result,
    SubscriptionHandle,
    TransportPtr,
};

/// Map a group and event to the destination both sides agree on.
///
/// The mapping is `"{group}_{event}"`. It is not injective when names
/// themselves contain `_` (`"a_b" + "c"` and `"a" + "b_c"` collide), so groups
/// sharing an exchange should avoid underscores in one of the two parts.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidName`] if either part is empty.
pub fn destination_name(group: &str, event: &str) -> Result<String> {
    // ---
    if group.is_empty() {
        return Err(BrokerError::InvalidName("group must not be empty".into()));
    }
    if event.is_empty() {
        return Err(BrokerError::InvalidName("event must not be empty".into()));
    }
    Ok(format!("{group}_{event}"))
}

/// Destination a subscriber consumes for `event`.
fn consumed_destination(exchange: Option<&str>, group: &str, event: &str) -> Result<String> {
    // ---
    let name = destination_name(group, event)?;
    Ok(match exchange {
        Some(_) => name,
        None => event.to_string(),
    })
}

struct Entry {
    event: String,
    address: Address,
}

#[derive(Default)]
struct RegistryState {
    /// Keyed by destination name.
    subscribed: HashMap<String, Entry>,
    /// One consumption loop per destination; kept across unsubscribe when
    /// an exchange is in use.
    loops: HashMap<Address, JoinHandle<()>>,
    closed: bool,
}

pub(crate) struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Subscribe `events` for `group`.
    ///
    /// Events are processed in order. On the first failure the error is
    /// returned; events handled before it stay subscribed and the failing
    /// one is not marked.
    ///
    /// `start` is called once per new destination with the event name and
    /// the consumer handle, and returns the task driving the loop.
    pub(crate) async fn subscribe<S, F>(
        &self,
        transport: &TransportPtr,
        exchange: Option<&str>,
        group: &str,
        events: &[S],
        mut start: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(&str, SubscriptionHandle) -> JoinHandle<()>,
    {
        // ---
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Destroyed);
        }

        for event in events {
            let event = event.as_ref();
            let name = consumed_destination(exchange, group, event)?;

            if state.subscribed.contains_key(&name) {
                log_debug!("{name}: already subscribed");
                continue;
            }

            let address = transport
                .provision(&name, DestinationOptions::shared())
                .await?;

            if let Some(exchange) = exchange {
                transport.bind(&address, exchange, event).await?;
            }

            if !state.loops.contains_key(&address) {
                let handle = transport.consume(&address).await?;
                let task = start(event, handle);
                state.loops.insert(address.clone(), task);
                log_info!("{address}: consumption loop started");
            }

            state.subscribed.insert(
                name,
                Entry {
                    event: event.to_string(),
                    address,
                },
            );
        }

        Ok(())
    }

    /// Unsubscribe `events` for `group`. Unknown events are ignored.
    pub(crate) async fn unsubscribe<S>(
        &self,
        transport: &TransportPtr,
        exchange: Option<&str>,
        group: &str,
        events: &[S],
    ) -> Result<()>
    where
        S: AsRef<str>,
    {
        // ---
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Destroyed);
        }

        for event in events {
            let event = event.as_ref();
            let name = consumed_destination(exchange, group, event)?;

            let Some(entry) = state.subscribed.remove(&name) else {
                log_debug!("{name}: not subscribed");
                continue;
            };

            match exchange {
                Some(exchange) => {
                    let unbound = transport.unbind(&entry.address, exchange, &entry.event).await;
                    if let Err(err) = unbound {
                        // keep the bookkeeping consistent with the transport
                        state.subscribed.insert(name, entry);
                        return Err(err);
                    }
                }
                None => {
                    if let Some(task) = state.loops.remove(&entry.address) {
                        task.abort();
                        log_info!("{}: consumption loop stopped", entry.address);
                    }
                }
            }

            log_debug!("{name}: unsubscribed");
        }

        Ok(())
    }

    /// Event names currently subscribed, sorted.
    pub(crate) async fn subscribed_events(&self) -> Vec<String> {
        // ---
        let state = self.state.lock().await;
        let mut events: Vec<String> = state
            .subscribed
            .values()
            .map(|e| e.event.clone())
            .collect();
        events.sort();
        events.dedup();
        events
    }

    /// Whether `event` is subscribed for `group` (exchange mode).
    #[cfg(test)]
    pub(crate) async fn is_subscribed(&self, group: &str, event: &str) -> bool {
        match destination_name(group, event) {
            Ok(name) => self.state.lock().await.subscribed.contains_key(&name),
            Err(_) => false,
        }
    }

    /// Number of running consumption loops.
    #[cfg(test)]
    pub(crate) async fn loop_count(&self) -> usize {
        self.state.lock().await.loops.len()
    }

    /// Stop every consumption loop and refuse further changes.
    pub(crate) async fn shutdown(&self) {
        // ---
        let mut state = self.state.lock().await;
        state.closed = true;
        for (_address, task) in state.loops.drain() {
            log_debug!("{_address}: stopping consumption loop");
            task.abort();
        }
    }
}
