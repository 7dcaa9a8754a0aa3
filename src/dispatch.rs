//! Event dispatch.
//!
//! Glue between a transport inbox and the listeners registered on a broker:
//!
//! - [`Listeners`] maps event names to an ordered list of callbacks.
//! - [`ErrorSink`] is the broker's error channel.
//! - [`spawn_consumer`] drives one destination's receive loop: decode each
//!   envelope, build the handler payload, and run every listener for the
//!   event in registration order.
//!
//! A listener returning `Err` or panicking is reported on the error channel
//! and does not stop the remaining listeners or the loop. The loop ends when
//! the inbox closes; if the broker is not shutting down at that point, the
//! closure is reported as a transport error.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::BrokerCore;
use crate::{
    // ---
    log_debug,
    log_error,
    BrokerError,
    Envelope,
    Result,
    SubscriptionHandle,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ListenerFn<M> = Arc<dyn Fn(M) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle identifying one registered listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ordered listener lists keyed by event name.
pub(crate) struct Listeners<M> {
    next_id: AtomicU64,
    map: Mutex<HashMap<String, Vec<(ListenerId, ListenerFn<M>)>>>,
}

impl<M> Listeners<M>
where
    M: Clone + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let f: ListenerFn<M> = Arc::new(move |msg: M| Box::pin(listener(msg)) as BoxFuture<'static, _>);

        lock_ignore_poison(&self.map)
            .entry(event.to_string())
            .or_default()
            .push((id, f));
        id
    }

    pub(crate) fn remove(&self, event: &str, id: ListenerId) -> bool {
        // ---
        let mut map = lock_ignore_poison(&self.map);
        let Some(list) = map.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(event);
        }
        removed
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        lock_ignore_poison(&self.map)
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Copy of the current list so listeners run without the lock held.
    fn snapshot(&self, event: &str) -> Vec<ListenerFn<M>> {
        lock_ignore_poison(&self.map)
            .get(event)
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Run every listener for `event` with a clone of `message`, in
    /// registration order.
    pub(crate) async fn notify(&self, event: &str, message: M, errors: &ErrorSink) {
        // ---
        let list = self.snapshot(event);
        if list.is_empty() {
            log_debug!("{event}: no listeners, message dropped");
            return;
        }

        for listener in list {
            let msg = message.clone();
            let run = AssertUnwindSafe(async move { listener(msg).await }).catch_unwind();

            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.report(BrokerError::handler(event, err)),
                Err(panic) => errors.report(BrokerError::handler(event, panic_message(&*panic))),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}

/// The broker's error channel.
///
/// Reports are logged and broadcast to every receiver obtained from
/// `errors()`. A receiver that falls behind loses the oldest reports.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    tx: broadcast::Sender<Arc<BrokerError>>,
}

impl ErrorSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn report(&self, err: BrokerError) {
        log_error!("{err}");
        // no receivers is fine
        let _ = self.tx.send(Arc::new(err));
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<BrokerError>> {
        self.tx.subscribe()
    }
}

/// Start the receive loop for one subscribed destination.
///
/// `build` turns the decoded payload and its envelope into the message
/// type the listeners expect.
pub(crate) fn spawn_consumer<M, B>(
    core: Arc<BrokerCore>,
    listeners: Arc<Listeners<M>>,
    event: &str,
    handle: SubscriptionHandle,
    build: B,
) -> JoinHandle<()>
where
    M: Clone + Send + 'static,
    B: Fn(&BrokerCore, &str, Value, &Envelope) -> M + Send + Sync + 'static,
{
    // ---
    let event = event.to_string();
    let SubscriptionHandle { address, mut inbox } = handle;

    tokio::spawn(async move {
        log_debug!("{address}: receive loop started for {event}");

        while let Some(env) = inbox.recv().await {
            let data = match core.codec().decode(&env.payload) {
                Ok(data) => data,
                Err(err) => {
                    core.errors.report(err);
                    continue;
                }
            };

            let message = build(&*core, &event, data, &env);
            listeners.notify(&event, message, &core.errors).await;
        }

        if core.is_destroyed() {
            log_debug!("{address}: receive loop stopped");
        } else {
            core.errors.report(BrokerError::Transport(format!(
                "consumer for {address} closed by the transport"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_listeners_run_in_order_and_isolate_failures() {
        // ---
        let listeners: Listeners<u32> = Listeners::new();
        let sink = ErrorSink::new(8);
        let mut errors = sink.subscribe();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        listeners.add("tick", move |n: u32| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push(("first", n));
                Err::<(), _>(BrokerError::handler("tick", "boom"))
            }
        });

        listeners.add("tick", |_n: u32| async move {
            if true {
                panic!("listener blew up");
            }
            Ok::<(), BrokerError>(())
        });

        let o = order.clone();
        listeners.add("tick", move |n: u32| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push(("third", n));
                Ok::<(), BrokerError>(())
            }
        });

        listeners.notify("tick", 7, &sink).await;

        assert_eq!(*order.lock().unwrap(), vec![("first", 7), ("third", 7)]);

        let first = errors.recv().await.unwrap();
        assert!(matches!(*first, BrokerError::Handler { .. }));
        let second = errors.recv().await.unwrap();
        assert!(second.to_string().contains("listener blew up"));
    }

    #[tokio::test]
    async fn test_remove_listener() {
        // ---
        let listeners: Listeners<()> = Listeners::new();
        let sink = ErrorSink::new(8);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let id = listeners.add("ping", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BrokerError>(())
            }
        });

        assert_eq!(listeners.count("ping"), 1);
        assert!(listeners.remove("ping", id));
        assert!(!listeners.remove("ping", id));
        assert_eq!(listeners.count("ping"), 0);

        listeners.notify("ping", (), &sink).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
