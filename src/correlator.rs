//! RPC correlation.
//!
//! Every outbound call gets its own exclusive reply destination and a fresh
//! correlation token. A pending call is settled exactly once, by whichever
//! comes first:
//!
//! - the first reply carrying the call's token
//! - the deadline
//! - a transport failure while setting the call up or waiting
//! - the broker being destroyed
//!
//! Settling removes the call from the pending map, stops its timer and reply
//! listener, and releases the reply destination. Anything arriving for the
//! call afterwards is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    Address,
    BrokerError,
    CodecPtr,
    CorrelationId,
    DestinationOptions,
    Envelope,
    Result,
    Route,
    SubscriptionHandle,
    TransportPtr,
};

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One outstanding call.
struct PendingCall {
    created: Instant,
    reply_to: Address,
    settled: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Result<Value>>>>,
    /// Timer and reply listener.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingCall {
    fn new(reply_to: Address, tx: oneshot::Sender<Result<Value>>) -> Self {
        Self {
            created: Instant::now(),
            reply_to,
            settled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Track a task that must stop once the call settles.
    fn attach(&self, task: JoinHandle<()>) {
        // ---
        let mut tasks = lock_ignore_poison(&self.tasks);
        if self.is_settled() {
            task.abort();
        } else {
            tasks.push(task);
        }
    }

    /// Deliver the outcome and stop the helper tasks. Caller must have won
    /// the settle flag.
    fn finish(&self, outcome: Result<Value>) {
        // ---
        for task in lock_ignore_poison(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(tx) = lock_ignore_poison(&self.tx).take() {
            // caller may have gone away
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<CorrelationId, Arc<PendingCall>>,
    closed: bool,
}

struct Shared {
    transport: TransportPtr,
    codec: CodecPtr,
    pending: Mutex<PendingState>,
}

impl Shared {
    /// Settle `token` with `outcome`. Returns `false` if the call was
    /// already settled or is unknown.
    fn settle(&self, token: &CorrelationId, outcome: Result<Value>) -> bool {
        // ---
        let call = {
            let mut pending = lock_ignore_poison(&self.pending);
            let Some(call) = pending.calls.get(token).cloned() else {
                return false;
            };
            if call.settled.swap(true, Ordering::AcqRel) {
                return false;
            }
            pending.calls.remove(token);
            call
        };

        let elapsed = call.created.elapsed();
        match &outcome {
            Ok(_) => log_debug!("{token}: resolved after {elapsed:?}"),
            Err(err) => log_debug!("{token}: rejected after {elapsed:?}: {err}"),
        }

        call.finish(outcome);
        self.release_later(call.reply_to.clone());
        true
    }

    /// Best-effort removal of a reply destination.
    fn release_later(&self, reply_to: Address) {
        // ---
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        runtime.spawn(async move {
            if let Err(err) = transport.release(&reply_to).await {
                log_warn!("{reply_to}: failed to release reply destination: {err}");
            }
        });
    }
}

/// Settles the call as abandoned if the caller stops waiting.
struct AbandonOnDrop {
    shared: Arc<Shared>,
    token: CorrelationId,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.shared.settle(
            &self.token,
            Err(BrokerError::Transport("call abandoned by caller".into())),
        );
    }
}

/// Tracks outstanding calls of one RPC broker.
pub(crate) struct Correlator {
    shared: Arc<Shared>,
}

impl Correlator {
    pub(crate) fn new(transport: TransportPtr, codec: CodecPtr) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                codec,
                pending: Mutex::new(PendingState::default()),
            }),
        }
    }

    /// Number of calls still waiting for an outcome.
    pub(crate) fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.shared.pending).calls.len()
    }

    /// Send an already encoded request along `route` and wait for the
    /// decoded reply.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Timeout`] if no matching reply arrives in time
    /// - [`BrokerError::Transport`] if the reply destination cannot be set
    ///   up, the request cannot be published, or the reply destination
    ///   closes while waiting
    /// - [`BrokerError::Destroyed`] if the broker is destroyed first
    /// - codec errors for an undecodable reply
    pub(crate) async fn call(
        &self,
        route: Route,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Value> {
        // ---
        let shared = &self.shared;
        let transport = &shared.transport;

        if lock_ignore_poison(&shared.pending).closed {
            return Err(BrokerError::Destroyed);
        }

        let reply_to = transport
            .provision("", DestinationOptions::ephemeral())
            .await?;
        let token = CorrelationId::generate();

        let (tx, rx) = oneshot::channel();
        let call = Arc::new(PendingCall::new(reply_to.clone(), tx));
        {
            let mut pending = lock_ignore_poison(&shared.pending);
            if pending.closed {
                drop(pending);
                shared.release_later(reply_to);
                return Err(BrokerError::Destroyed);
            }
            pending.calls.insert(token.clone(), call.clone());
        }

        let _guard = AbandonOnDrop {
            shared: shared.clone(),
            token: token.clone(),
        };

        log_debug!("{token}: calling {route}, reply via {reply_to}");

        match transport.consume(&reply_to).await {
            Ok(handle) => {
                let listener = tokio::spawn(await_reply(shared.clone(), token.clone(), handle));
                call.attach(listener);
            }
            Err(err) => {
                shared.settle(&token, Err(err));
            }
        }

        if !call.is_settled() {
            let timer_shared = shared.clone();
            let timer_token = token.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer_shared.settle(&timer_token, Err(BrokerError::Timeout(timeout)));
            });
            call.attach(timer);
        }

        if !call.is_settled() {
            let env = Envelope::request(
                payload,
                token.to_arc(),
                reply_to,
                Arc::from(shared.codec.content_type()),
            );
            if let Err(err) = transport.publish(route, env).await {
                shared.settle(&token, Err(err));
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::Destroyed),
        }
    }

    /// Reject every outstanding call with [`BrokerError::Destroyed`] and
    /// refuse new ones.
    pub(crate) async fn reject_all(&self) {
        // ---
        let calls: Vec<(CorrelationId, Arc<PendingCall>)> = {
            let mut pending = lock_ignore_poison(&self.shared.pending);
            pending.closed = true;
            pending.calls.drain().collect()
        };

        for (_token, call) in calls {
            if call.settled.swap(true, Ordering::AcqRel) {
                continue;
            }
            log_debug!("{_token}: rejected, broker destroyed");
            call.finish(Err(BrokerError::Destroyed));

            if let Err(err) = self.shared.transport.release(&call.reply_to).await {
                log_warn!("{}: failed to release reply destination: {err}", call.reply_to);
            }
        }
    }

    #[cfg(test)]
    fn settle(&self, token: &CorrelationId, outcome: Result<Value>) -> bool {
        self.shared.settle(token, outcome)
    }
}

/// Wait on a call's reply destination for the envelope carrying `token`.
async fn await_reply(shared: Arc<Shared>, token: CorrelationId, handle: SubscriptionHandle) {
    // ---
    let SubscriptionHandle { address, mut inbox } = handle;

    while let Some(env) = inbox.recv().await {
        if let Some(tag) = env.delivery_tag {
            if let Err(err) = shared.transport.acknowledge(tag).await {
                log_warn!("{address}: failed to acknowledge reply: {err}");
            }
        }

        if env.correlation_id.as_deref() != Some(token.as_str()) {
            log_debug!(
                "{address}: discarding reply for {:?}, waiting for {token}",
                env.correlation_id
            );
            continue;
        }

        let outcome = shared.codec.decode(&env.payload);
        shared.settle(&token, outcome);
        return;
    }

    shared.settle(
        &token,
        Err(BrokerError::Transport(format!(
            "reply destination {address} closed before a reply arrived"
        ))),
    );
}
