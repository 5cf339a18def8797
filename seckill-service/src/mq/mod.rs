//! In-process message broker with topic-exchange semantics.
//!
//! The shapes the consumers rely on are all here: durable queues bound to
//! topic exchanges by wildcard keys, per-queue dead-letter exchanges,
//! consumer prefetch, explicit ack/nack with requeue or dead-letter routing,
//! and publisher-confirm streams per channel. A delivery dropped without
//! being settled goes back to the front of its queue, the same recovery a
//! broker performs when a consumer channel dies.

pub mod pool;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection lost")]
    ConnectionLost,
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("publish not acked")]
    Nacked,
    #[error("publish confirm timeout")]
    ConfirmTimeout,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: String,
    pub routing_key: String,
    pub content_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

#[derive(Debug, Default)]
pub struct QueueArgs {
    pub dead_letter_exchange: Option<String>,
}

struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct ExchangeState {
    bindings: Mutex<Vec<Binding>>,
}

struct QueueState {
    name: String,
    dead_letter_exchange: Option<String>,
    ready: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerInner {
    exchanges: Mutex<HashMap<String, Arc<ExchangeState>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    fail_publishes: AtomicBool,
}

impl BrokerInner {
    fn route(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        let exchange_state = self
            .exchanges
            .lock()
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let targets: Vec<String> = exchange_state
            .bindings
            .lock()
            .iter()
            .filter(|b| topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let queues = self.queues.lock();
        let mut matched = 0;
        for name in targets {
            if let Some(queue) = queues.get(&name) {
                queue.ready.lock().push_back(envelope.clone());
                queue.notify.notify_one();
                matched += 1;
            }
        }
        if matched == 0 {
            debug!(exchange, routing_key, "message matched no queue");
        }
        Ok(matched)
    }

    fn requeue_front(&self, queue: &Arc<QueueState>, mut envelope: Envelope) {
        envelope.redelivered = true;
        queue.ready.lock().push_front(envelope);
        queue.notify.notify_one();
    }
}

/// `*` matches exactly one dot-separated segment, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn rec(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|i| rec(rest, &key[i..])),
            Some((&"*", rest)) => !key.is_empty() && rec(rest, &key[1..]),
            Some((&segment, rest)) => {
                !key.is_empty() && key[0] == segment && rec(rest, &key[1..])
            }
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    rec(&pattern, &key)
}

#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-declaring an existing exchange is a no-op.
    pub fn declare_exchange(&self, name: &str) {
        self.inner
            .exchanges
            .lock()
            .entry(name.to_string())
            .or_default();
    }

    /// Idempotent: an existing queue keeps its original arguments.
    pub fn declare_queue(&self, name: &str, args: QueueArgs) {
        self.inner
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    dead_letter_exchange: args.dead_letter_exchange,
                    ready: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            });
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        if !self.inner.queues.lock().contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let exchange_state = self
            .inner
            .exchanges
            .lock()
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let mut bindings = exchange_state.bindings.lock();
        if !bindings.iter().any(|b| b.queue == queue && b.pattern == pattern) {
            bindings.push(Binding { queue: queue.to_string(), pattern: pattern.to_string() });
        }
        Ok(())
    }

    /// Open a confirm-mode channel. The receiver carries one confirmation
    /// per publish; the producer pool drains it in the background.
    pub fn channel(&self) -> (Channel, mpsc::UnboundedReceiver<Confirmation>) {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        (
            Channel {
                inner: self.inner.clone(),
                confirm_tx,
                publish_seq: AtomicU64::new(0),
            },
            confirm_rx,
        )
    }

    pub fn consume(&self, queue: &str, prefetch: usize) -> Result<QueueConsumer, BrokerError> {
        let queue = self
            .inner
            .queues
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        Ok(QueueConsumer {
            queue,
            inner: self.inner.clone(),
            prefetch: Arc::new(Semaphore::new(prefetch.max(1))),
        })
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.ready.lock().len())
            .unwrap_or(0)
    }

    /// Makes every publish fail with a connection error, until switched
    /// back. Test hook for the admission compensation path.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

pub struct Channel {
    inner: Arc<BrokerInner>,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    publish_seq: AtomicU64,
}

impl Channel {
    /// Persistent JSON publish. Returns the delivery tag; the matching
    /// confirmation arrives on the channel's confirm stream.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        message_id: &str,
    ) -> Result<u64, BrokerError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost);
        }
        let envelope = Envelope {
            message_id: message_id.to_string(),
            routing_key: routing_key.to_string(),
            content_type: "application/json",
            timestamp: Utc::now(),
            body,
            redelivered: false,
        };
        self.inner.route(exchange, routing_key, envelope)?;
        let tag = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.confirm_tx.send(Confirmation { delivery_tag: tag, ack: true });
        Ok(tag)
    }
}

pub struct QueueConsumer {
    queue: Arc<QueueState>,
    inner: Arc<BrokerInner>,
    prefetch: Arc<Semaphore>,
}

impl QueueConsumer {
    /// Next delivery, waiting for a prefetch slot first. Returns None only
    /// if the prefetch window is closed (never happens today; the shape
    /// leaves room for a consumer-side close).
    pub async fn next(&self) -> Option<Delivery> {
        let permit = self.prefetch.clone().acquire_owned().await.ok()?;
        loop {
            let notified = self.queue.notify.notified();
            if let Some(envelope) = self.queue.ready.lock().pop_front() {
                return Some(Delivery {
                    envelope,
                    queue: self.queue.clone(),
                    inner: self.inner.clone(),
                    _permit: permit,
                    settled: false,
                });
            }
            notified.await;
        }
    }
}

pub struct Delivery {
    pub envelope: Envelope,
    queue: Arc<QueueState>,
    inner: Arc<BrokerInner>,
    _permit: OwnedSemaphorePermit,
    settled: bool,
}

impl Delivery {
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    pub fn ack(mut self) {
        self.settled = true;
    }

    /// `requeue == true` puts the message back at the head of its queue;
    /// `requeue == false` routes it to the queue's dead-letter exchange, or
    /// drops it when none is configured.
    pub fn nack(mut self, requeue: bool) {
        self.settled = true;
        if requeue {
            self.inner.requeue_front(&self.queue, self.envelope.clone());
            return;
        }
        match &self.queue.dead_letter_exchange {
            Some(dlx) => {
                let envelope = self.envelope.clone();
                let routing_key = envelope.routing_key.clone();
                if let Err(e) = self.inner.route(dlx, &routing_key, envelope) {
                    warn!(queue = %self.queue.name, error = %e, "dead-letter routing failed");
                }
            }
            None => {
                warn!(
                    queue = %self.queue.name,
                    message_id = %self.envelope.message_id,
                    "message dropped: nacked without a dead-letter exchange"
                );
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.requeue_front(&self.queue, self.envelope.clone());
        }
    }
}

/// Declare the full topology. Safe to call from every role at startup.
pub fn declare_topology(broker: &Broker) -> Result<(), BrokerError> {
    broker.declare_exchange(shared::EXCHANGE);
    broker.declare_exchange(shared::DLX);

    broker.declare_queue(
        shared::QUEUE_ORDER_CREATE,
        QueueArgs { dead_letter_exchange: Some(shared::DLX.to_string()) },
    );
    broker.declare_queue(shared::QUEUE_ORDER_CANCELED, QueueArgs::default());
    broker.declare_queue(shared::QUEUE_ORDER_CREATE_DLQ, QueueArgs::default());
    broker.declare_queue(shared::QUEUE_STOCK_LOG, QueueArgs::default());

    broker.bind_queue(shared::QUEUE_ORDER_CREATE, shared::EXCHANGE, shared::KEY_ORDER_CREATE)?;
    broker.bind_queue(shared::QUEUE_ORDER_CANCELED, shared::EXCHANGE, shared::KEY_ORDER_CANCELED)?;
    broker.bind_queue(shared::QUEUE_ORDER_CREATE_DLQ, shared::DLX, "#")?;
    broker.bind_queue(shared::QUEUE_STOCK_LOG, shared::EXCHANGE, "stock.#")?;
    Ok(())
}
