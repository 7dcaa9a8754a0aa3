//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! a single AMQP connection and channel.
//!
//! ## Mapping
//!
//! - Destinations are AMQP queues. Shared destinations are declared
//!   non-durable and non-exclusive; ephemeral ones are declared exclusive and
//!   auto-delete, and an empty name lets the server pick one.
//! - Exchanges are `direct` exchanges, declared on first bind or publish.
//!   Routing keys are matched by equality, like the memory transport.
//! - `Route::Direct` publishes through the default exchange with the queue
//!   name as routing key.
//! - Correlation token, reply destination, and content type travel in the
//!   standard AMQP message properties, so non-Rust peers can interoperate.
//! - Acknowledgement uses `basic.ack` with the delivery tag; consumers run
//!   with manual acknowledgement.
//!
//! ## Concurrency model
//!
//! `lapin::Channel` is internally synchronized, so operations are issued
//! directly from the calling task. Each `consume()` spawns a forwarding task
//! that moves deliveries from the lapin consumer stream into the inbox. The
//! task stops when the inbox is dropped. Consumers are tracked per queue:
//! `release()` cancels the queue's consumers and aborts their tasks, and
//! `close()` aborts whatever is left.
//!
//! ## Scope and limitations
//!
//! No reconnect: when the connection drops, every inbox ends and operations
//! fail with a transport error. Reconnection is left to the surrounding
//! system.

use futures_util::StreamExt;

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
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

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consumer tags and forwarding tasks per consumed queue.
#[derive(Default)]
struct ConsumerTable {
    by_queue: HashMap<Address, Vec<(String, JoinHandle<()>)>>,
}

impl ConsumerTable {
    /// Record a consumer, dropping entries whose task already ended.
    fn insert(&mut self, address: Address, consumer_tag: String, handle: JoinHandle<()>) {
        // ---
        self.by_queue.retain(|_, list| {
            list.retain(|(_, task)| !task.is_finished());
            !list.is_empty()
        });
        self.by_queue
            .entry(address)
            .or_default()
            .push((consumer_tag, handle));
    }

    /// Forget the consumers of `address`, aborting their tasks. Returns
    /// their consumer tags.
    fn remove(&mut self, address: &Address) -> Vec<String> {
        // ---
        let list = self.by_queue.remove(address).unwrap_or_default();
        list.into_iter()
            .map(|(tag, task)| {
                task.abort();
                tag
            })
            .collect()
    }

    fn abort_all(&mut self) {
        for (_, list) in self.by_queue.drain() {
            for (_, task) in list {
                task.abort();
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_queue.values().map(Vec::len).sum()
    }
}

fn amqp_err(op: &str, err: lapin::Error) -> BrokerError {
    BrokerError::Transport(format!("amqp: {op} failed: {err}"))
}

/// AMQP transport implementation using lapin.
pub struct AmqpTransport {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    exchanges: Mutex<HashSet<String>>,
    consumers: Mutex<ConsumerTable>,
}

impl AmqpTransport {
    /// Declare `exchange` once per transport.
    async fn ensure_exchange(&self, exchange: &str) -> Result<()> {
        // ---
        if lock_ignore_poison(&self.exchanges).contains(exchange) {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_err("exchange declare", e))?;

        log_debug!("[{}] declared exchange {exchange}", self.transport_id);
        lock_ignore_poison(&self.exchanges).insert(exchange.to_string());
        Ok(())
    }

    fn properties(env: &Envelope) -> BasicProperties {
        // ---
        let mut props = BasicProperties::default();
        if let Some(id) = &env.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.to_string()));
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.to_string()));
        }
        if let Some(content_type) = &env.content_type {
            props = props.with_content_type(ShortString::from(content_type.to_string()));
        }
        props
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn provision(&self, name: &str, opts: DestinationOptions) -> Result<Address> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name, queue_opts, FieldTable::default())
            .await
            .map_err(|e| amqp_err("queue declare", e))?;

        let address = Address::from(queue.name().as_str());
        log_info!("[{}] declared queue {address}", self.transport_id);
        Ok(address)
    }

    async fn bind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.ensure_exchange(exchange).await?;

        self.channel
            .queue_bind(
                address.as_str(),
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_err("queue bind", e))
    }

    async fn unbind(&self, address: &Address, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_unbind(address.as_str(), exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| amqp_err("queue unbind", e))
    }

    async fn publish(&self, route: Route, env: Envelope) -> Result<()> {
        // ---
        let (exchange, routing_key): (String, String) = match &route {
            Route::Exchange {
                exchange,
                routing_key,
            } => {
                self.ensure_exchange(exchange).await?;
                (exchange.to_string(), routing_key.to_string())
            }
            Route::Direct(address) => (String::new(), address.to_string()),
        };

        let confirm = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &env.payload,
                Self::properties(&env),
            )
            .await
            .map_err(|e| amqp_err("publish", e))?;

        confirm.await.map_err(|e| amqp_err("publish confirm", e))?;

        log_debug!("[{}] published to {route}", self.transport_id);
        Ok(())
    }

    async fn consume(&self, address: &Address) -> Result<SubscriptionHandle> {
        // ---
        let consumer_tag = format!("{}-{}", self.transport_id, Uuid::new_v4().simple());

        let mut consumer = self
            .channel
            .basic_consume(
                address.as_str(),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_err("consume", e))?;

        log_info!("[{}] consuming queue {address}", self.transport_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let transport_id = self.transport_id.clone();
        let queue = address.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = consumer.next() => next,
                    _ = tx.closed() => {
                        log_debug!("[{transport_id}] inbox for {queue} dropped");
                        break;
                    }
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(_e)) => {
                        log_error!("[{transport_id}] consumer error on {queue}: {_e}");
                        break;
                    }
                    None => break,
                };

                let props = &delivery.properties;
                let env = Envelope {
                    payload: delivery.data.clone().into(),
                    correlation_id: props.correlation_id().as_ref().map(|s| Arc::from(s.as_str())),
                    reply_to: props.reply_to().as_ref().map(|s| Address::from(s.as_str())),
                    content_type: props.content_type().as_ref().map(|s| Arc::from(s.as_str())),
                    routing_key: Some(Arc::from(delivery.routing_key.as_str())),
                    delivery_tag: Some(delivery.delivery_tag),
                };

                if tx.send(env).is_err() {
                    log_debug!("[{transport_id}] inbox for {queue} dropped");
                    break;
                }
            }

            log_info!("[{transport_id}] consumer task ended for {queue}");
        });

        lock_ignore_poison(&self.consumers).insert(address.clone(), consumer_tag, handle);

        Ok(SubscriptionHandle {
            address: address.clone(),
            inbox: rx,
        })
    }

    async fn acknowledge(&self, tag: DeliveryTag) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| amqp_err("ack", e))
    }

    async fn release(&self, address: &Address) -> Result<()> {
        // ---
        let tags = lock_ignore_poison(&self.consumers).remove(address);
        for tag in tags {
            // the queue delete below also ends the consumer server-side
            if let Err(_e) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                log_debug!("[{}] cancel of {tag} on {address} failed: {_e}", self.transport_id);
            }
        }

        self.channel
            .queue_delete(address.as_str(), QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| amqp_err("queue delete", e))
    }

    async fn close(&self) -> Result<()> {
        // ---
        lock_ignore_poison(&self.consumers).abort_all();

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP transport closed", self.transport_id);
        Ok(())
    }
}

/// Create a lapin-based AMQP transport connected to `uri`.
///
/// # Errors
///
/// Returns a transport error if the connection or channel cannot be
/// established. The connection is made immediately.
pub async fn create_transport(uri: &str, transport_id: &str) -> Result<TransportPtr> {
    // ---
    log_info!("[{transport_id}] connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let err = amqp_err("connect", e);
            log_error!("{err}");
            err
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let err = amqp_err("channel creation", e);
        log_error!("{err}");
        err
    })?;

    log_info!("[{transport_id}] connected to AMQP broker");

    Ok(Arc::new(AmqpTransport {
        transport_id: transport_id.to_string(),
        connection,
        channel,
        exchanges: Mutex::new(HashSet::new()),
        consumers: Mutex::new(ConsumerTable::default()),
    }))
}
