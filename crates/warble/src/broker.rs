use crate::error::{Error, Result};
use bytes::Bytes;
use core::sync::atomic::Ordering;
use parking_lot::Mutex;
use portable_atomic::AtomicU64;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize},
    },
};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Tunables for every queue the broker creates.
#[derive(Clone, Copy, Debug)]
pub struct BrokerConfig {
    /// Messages a queue holds before publishers block.
    pub queue_capacity: usize,
    /// Redeliveries granted to a nacked message before it is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_redeliveries: 3,
        }
    }
}

/// An in-process message broker with AMQP-shaped primitives.
///
/// Exchanges route by exact match on the binding key, queues are bounded
/// and block publishers when full, and deliveries are settled explicitly
/// with [`Delivery::ack`] or [`Delivery::nack`]. A delivery dropped without
/// either goes back to the front of its queue, so a consumer that dies
/// mid-message never loses it.
///
/// Cloning is cheap; all clones observe the same exchanges and queues.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    exchanges: Mutex<HashMap<String, Arc<ExchangeInner>>>,
    queues: Mutex<HashMap<String, Arc<QueueInner>>>,
    open_channels: AtomicUsize,
    closed: AtomicBool,
}

struct ExchangeInner {
    name: String,
    bindings: Mutex<Vec<Binding>>,
}

struct Binding {
    routing_key: String,
    queue: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    capacity: usize,
    max_redeliveries: u32,
    messages: Mutex<VecDeque<QueuedMessage>>,
    readable: Notify,
    writable: Notify,
    dead_lettered: AtomicU64,
    closed: AtomicBool,
}

struct QueuedMessage {
    payload: Bytes,
    routing_key: String,
    attempts: u32,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                exchanges: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                open_channels: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Opens a connection handle. Connections are free; channels opened
    /// from them are the unit clients pool and pass around.
    pub fn connect(&self) -> Connection {
        Connection {
            broker: Arc::clone(&self.inner),
        }
    }

    /// Number of channels currently open across all connections.
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::Acquire)
    }

    /// Messages sitting in `queue`, requeued ones included.
    pub fn queue_depth(&self, queue: &str) -> Result<usize> {
        Ok(self.inner.queue(queue)?.messages.lock().len())
    }

    /// Messages dropped from `queue` after exhausting their redeliveries.
    pub fn dead_lettered(&self, queue: &str) -> Result<u64> {
        Ok(self.inner.queue(queue)?.dead_lettered.load(Ordering::Relaxed))
    }

    /// Closes the broker. Blocked publishers and consumers wake with
    /// [`Error::BrokerClosed`]; consumers drain buffered messages first.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let queues: Vec<_> = self.inner.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.closed.store(true, Ordering::Release);
            queue.readable.notify_waiters();
            queue.writable.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Result<Arc<QueueInner>> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue {
                queue: name.to_owned(),
            })
    }

    fn exchange(&self, name: &str) -> Result<Arc<ExchangeInner>> {
        self.exchanges
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownExchange {
                exchange: name.to_owned(),
            })
    }
}

/// A handle for opening channels on a [`Broker`].
pub struct Connection {
    broker: Arc<BrokerInner>,
}

impl Connection {
    /// # Errors
    ///
    /// Fails with [`Error::BrokerClosed`] once the broker has shut down.
    pub fn open_channel(&self) -> Result<Channel> {
        if self.broker.closed.load(Ordering::Acquire) {
            return Err(Error::BrokerClosed);
        }
        self.broker.open_channels.fetch_add(1, Ordering::AcqRel);
        Ok(Channel {
            broker: Arc::clone(&self.broker),
            open: AtomicBool::new(true),
        })
    }
}

/// A broker channel. Declarations are idempotent; publishing to an
/// exchange nobody bound a matching queue to succeeds and drops the
/// message, mirroring how a topic exchange treats unroutable publishes.
pub struct Channel {
    broker: Arc<BrokerInner>,
    open: AtomicBool,
}

impl Channel {
    fn ensure_open(&self) -> Result<()> {
        if self.broker.closed.load(Ordering::Acquire) {
            return Err(Error::BrokerClosed);
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    pub fn exchange_declare(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .exchanges
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ExchangeInner {
                    name: name.to_owned(),
                    bindings: Mutex::new(Vec::new()),
                })
            });
        Ok(())
    }

    pub fn queue_declare(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let config = self.broker.config;
        self.broker
            .queues
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(QueueInner {
                    name: name.to_owned(),
                    capacity: config.queue_capacity,
                    max_redeliveries: config.max_redeliveries,
                    messages: Mutex::new(VecDeque::new()),
                    readable: Notify::new(),
                    writable: Notify::new(),
                    dead_lettered: AtomicU64::new(0),
                    closed: AtomicBool::new(false),
                })
            });
        Ok(())
    }

    /// Binds `queue` to `exchange` under `routing_key`. Binding keys are
    /// compared literally at publish time; rebinding the same triple is a
    /// no-op.
    pub fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let queue = self.broker.queue(queue)?;
        let exchange = self.broker.exchange(exchange)?;
        let mut bindings = exchange.bindings.lock();
        let already_bound = bindings
            .iter()
            .any(|b| b.routing_key == routing_key && b.queue.name == queue.name);
        if !already_bound {
            bindings.push(Binding {
                routing_key: routing_key.to_owned(),
                queue,
            });
        }
        Ok(())
    }

    /// Publishes `payload` to every queue bound to `exchange` under
    /// `routing_key`, blocking while any of them is full.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownExchange`] if the exchange was never declared.
    /// - [`Error::BrokerClosed`] if the broker shuts down while blocked.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let exchange = self.broker.exchange(exchange)?;
        let targets: Vec<_> = {
            let bindings = exchange.bindings.lock();
            bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .map(|b| Arc::clone(&b.queue))
                .collect()
        };
        if targets.is_empty() {
            debug!(
                exchange = %exchange.name,
                routing_key,
                "no queue bound for routing key, dropping message"
            );
            return Ok(());
        }
        for queue in targets {
            queue.push(payload.clone(), routing_key).await?;
        }
        Ok(())
    }

    pub fn consume(&self, queue: &str) -> Result<Consumer> {
        self.ensure_open()?;
        Ok(Consumer {
            queue: self.broker.queue(queue)?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.broker.open_channels.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl QueueInner {
    async fn push(&self, payload: Bytes, routing_key: &str) -> Result<()> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            // Register before re-checking so a close or a pop between the
            // check and the await still wakes us.
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::BrokerClosed);
            }
            {
                let mut messages = self.messages.lock();
                if messages.len() < self.capacity {
                    messages.push_back(QueuedMessage {
                        payload,
                        routing_key: routing_key.to_owned(),
                        attempts: 0,
                    });
                    drop(messages);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn pop(self: &Arc<Self>) -> Result<Delivery> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut messages = self.messages.lock();
                if let Some(message) = messages.pop_front() {
                    drop(messages);
                    self.writable.notify_one();
                    return Ok(Delivery {
                        payload: message.payload,
                        routing_key: message.routing_key,
                        attempts: message.attempts,
                        queue: Some(Arc::clone(self)),
                    });
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::BrokerClosed);
            }
            notified.await;
        }
    }

    /// Requeues at the front, past the capacity check, so settling a
    /// delivery can never block.
    fn requeue_front(&self, payload: Bytes, routing_key: String, attempts: u32) {
        let mut messages = self.messages.lock();
        messages.push_front(QueuedMessage {
            payload,
            routing_key,
            attempts,
        });
        drop(messages);
        self.readable.notify_one();
    }
}

/// A consumer subscription on one queue.
pub struct Consumer {
    queue: Arc<QueueInner>,
}

impl Consumer {
    /// Waits for the next message.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::BrokerClosed`] once the broker shuts down and
    /// the queue has drained.
    pub async fn recv(&self) -> Result<Delivery> {
        self.queue.pop().await
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

/// One received message, owed an [`ack`](Self::ack) or a
/// [`nack`](Self::nack). Dropping it unsettled requeues it at the front
/// with its attempt count unchanged.
pub struct Delivery {
    payload: Bytes,
    routing_key: String,
    attempts: u32,
    queue: Option<Arc<QueueInner>>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .field("routing_key", &self.routing_key)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// How many times this message has been redelivered. Zero on first
    /// delivery.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Settles the message as handled; the broker forgets it.
    pub fn ack(mut self) {
        self.queue.take();
    }

    /// Settles the message as failed. It is redelivered with an
    /// incremented attempt count until that count exceeds the queue's
    /// redelivery budget, after which it is counted and dropped.
    pub fn nack(mut self) {
        if let Some(queue) = self.queue.take() {
            let next = self.attempts + 1;
            if next > queue.max_redeliveries {
                queue.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %queue.name,
                    routing_key = %self.routing_key,
                    deliveries = next,
                    "dead-lettering message after exhausting redeliveries"
                );
            } else {
                queue.requeue_front(self.payload.clone(), self.routing_key.clone(), next);
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.requeue_front(self.payload.clone(), self.routing_key.clone(), self.attempts);
        }
    }
}
