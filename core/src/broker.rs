// In-process broker with AMQP-like routing, for tests and single-process deployments
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::connector::{
    Connector, Delivery, DeliveryConsumer, Publish, SubscribeAck, SubscribeOptions,
    SubscribeRequest,
};
use crate::error::{MqError, Result};

/// Broker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Successful `subscribe` calls.
    pub subscribes: u64,
    /// Publishes accepted, routable or not.
    pub publishes: u64,
    /// Consumers cancelled through `unsubscribe`.
    pub cancels: u64,
    /// Messages handed to a consumer, including flushed backlog.
    pub delivered: u64,
    /// Messages that matched no queue, or expired in a backlog.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    subscribes: AtomicU64,
    publishes: AtomicU64,
    cancels: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Default)]
struct Faults {
    reject_publish: AtomicBool,
    reject_subscribe: AtomicBool,
    subscribe_latency_ms: AtomicU64,
}

struct ConsumerSlot {
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Buffered {
    message: Vec<u8>,
    topic: String,
    exchange: String,
    expires_at: Instant,
}

struct QueueState {
    exclusive: bool,
    auto_delete: bool,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    backlog: VecDeque<Buffered>,
}

impl QueueState {
    fn new(options: &SubscribeOptions) -> Self {
        Self {
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            consumers: Vec::new(),
            cursor: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Hands a message to the next consumer in turn. Returns it back when no
    /// consumer is attached.
    fn dispatch(&mut self, mut delivery: Delivery) -> Option<Delivery> {
        while !self.consumers.is_empty() {
            let slot = self.cursor % self.consumers.len();
            self.cursor = self.cursor.wrapping_add(1);
            delivery.consumer_tag = self.consumers[slot].tag.clone();
            match self.consumers[slot].tx.send(delivery) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(returned)) => {
                    // consumer task ended without a cancel
                    self.consumers.remove(slot);
                    delivery = returned;
                }
            }
        }
        Some(delivery)
    }

    /// Drops backlog entries whose ttl has passed. Returns how many went.
    fn purge_expired(&mut self, now: Instant) -> u64 {
        let before = self.backlog.len();
        self.backlog.retain(|m| m.expires_at > now);
        (before - self.backlog.len()) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    consumer_queues: HashMap<String, String>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    counters: Counters,
    faults: Faults,
    next_name: AtomicU64,
    closed: AtomicBool,
}

/// Process-local [`Connector`].
///
/// The default exchange (`""`) routes by queue name. A subscription on a
/// named exchange binds its queue with the topic pattern, or with the queue
/// name when the topic is empty. Patterns use `*` for one dot-separated word
/// and `#` for zero or more.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                counters: Counters::default(),
                faults: Faults::default(),
                next_name: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Builds a broker from router settings.
    ///
    /// `mq_uri` must be empty or use the `memory:` scheme. The connector
    /// options `reject_publish`, `reject_subscribe` (booleans) and
    /// `subscribe_latency_ms` preset the matching faults; other keys are
    /// ignored.
    pub fn connect(config: &RouterConfig) -> Result<Self> {
        if !config.mq_uri.is_empty() && !config.mq_uri.starts_with("memory:") {
            return Err(MqError::Config(format!(
                "in-memory broker cannot serve {}",
                config.mq_uri
            )));
        }
        let broker = Self::new();
        for (key, value) in &config.connector_options {
            let invalid = || MqError::Config(format!("connector option {key}: invalid value {value}"));
            match key.as_str() {
                "reject_publish" => broker.set_reject_publish(value.parse().map_err(|_| invalid())?),
                "reject_subscribe" => {
                    broker.set_reject_subscribe(value.parse().map_err(|_| invalid())?)
                }
                "subscribe_latency_ms" => broker.set_subscribe_latency(Duration::from_millis(
                    value.parse().map_err(|_| invalid())?,
                )),
                _ => debug!(target: "memory_broker", option = %key, "Ignoring connector option"),
            }
        }
        info!(target: "memory_broker", uri = %config.mq_uri, "In-memory broker ready");
        Ok(broker)
    }

    /// Snapshot of the counters since creation.
    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            subscribes: c.subscribes.load(Ordering::Relaxed),
            publishes: c.publishes.load(Ordering::Relaxed),
            cancels: c.cancels.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Makes every following publish fail with a broker error.
    pub fn set_reject_publish(&self, reject: bool) {
        self.inner.faults.reject_publish.store(reject, Ordering::Relaxed);
    }

    /// Makes every following subscribe fail with a broker error.
    pub fn set_reject_subscribe(&self, reject: bool) {
        self.inner
            .faults
            .reject_subscribe
            .store(reject, Ordering::Relaxed);
    }

    /// Delays each subscribe before it takes effect.
    pub fn set_subscribe_latency(&self, latency: Duration) {
        self.inner
            .faults
            .subscribe_latency_ms
            .store(
                u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().await.queues.contains_key(queue)
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting in `queue` for a consumer, expired ones excluded.
    pub async fn backlog_len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.iter().filter(|m| m.expires_at > now).count())
    }

    fn next_name(&self, prefix: &str) -> String {
        let n = self.inner.next_name.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MqError::Closed {
                origin: format!("memory_broker.{op}"),
            });
        }
        Ok(())
    }
}

fn spawn_consumer(
    consumer: Arc<dyn DeliveryConsumer>,
    prefetch: u16,
) -> mpsc::UnboundedSender<Delivery> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let permits = (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            let consumer = Arc::clone(&consumer);
            match &permits {
                Some(permits) => {
                    let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        consumer.deliver(delivery).await;
                        drop(permit);
                    });
                }
                None => {
                    tokio::spawn(async move { consumer.deliver(delivery).await });
                }
            }
        }
    });
    tx
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeAck> {
        self.ensure_open("subscribe")?;
        let latency = self.inner.faults.subscribe_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.faults.reject_subscribe.load(Ordering::Relaxed) {
            return Err(MqError::broker("memory_broker.subscribe", "subscribe rejected"));
        }

        let SubscribeRequest {
            destination,
            options,
            consumer,
        } = request;
        let queue_name = if destination.queue.is_empty() {
            self.next_name("amq.gen")
        } else {
            destination.queue.clone()
        };

        let mut state = self.inner.state.lock().await;
        self.ensure_open("subscribe")?;

        let queue = state
            .queues
            .entry(queue_name.clone())
            .or_insert_with(|| QueueState::new(&options));
        if !queue.consumers.is_empty() && (queue.exclusive || options.exclusive) {
            return Err(MqError::broker(
                "memory_broker.subscribe",
                format!("queue {queue_name} is locked by an exclusive consumer"),
            ));
        }
        if queue.consumers.is_empty() {
            queue.exclusive = options.exclusive;
        }

        let consumer_tag = self.next_name("ctag");
        queue.consumers.push(ConsumerSlot {
            tag: consumer_tag.clone(),
            tx: spawn_consumer(consumer, options.prefetch),
        });

        // flush what arrived while nobody was listening
        let now = Instant::now();
        let waiting: Vec<Buffered> = queue.backlog.drain(..).collect();
        let mut expired = 0u64;
        let mut flushed = 0u64;
        for message in waiting {
            if message.expires_at <= now {
                expired += 1;
                continue;
            }
            let delivery = Delivery {
                message: message.message,
                queue: queue_name.clone(),
                topic: message.topic,
                exchange: message.exchange,
                consumer_tag: String::new(),
            };
            if queue.dispatch(delivery).is_none() {
                flushed += 1;
            }
        }

        if !destination.exchange.is_empty() {
            let pattern = if destination.topic.is_empty() {
                queue_name.clone()
            } else {
                destination.topic.clone()
            };
            let binding = Binding {
                exchange: destination.exchange.clone(),
                pattern,
                queue: queue_name.clone(),
            };
            if !state.bindings.contains(&binding) {
                debug!(target: "memory_broker", exchange = %binding.exchange, pattern = %binding.pattern, queue = %queue_name, "Bound queue");
                state.bindings.push(binding);
            }
        }
        state
            .consumer_queues
            .insert(consumer_tag.clone(), queue_name.clone());
        drop(state);

        let c = &self.inner.counters;
        c.subscribes.fetch_add(1, Ordering::Relaxed);
        c.delivered.fetch_add(flushed, Ordering::Relaxed);
        c.dropped.fetch_add(expired, Ordering::Relaxed);
        info!(target: "memory_broker", queue = %queue_name, %consumer_tag, "Consumer attached");

        Ok(SubscribeAck {
            queue: queue_name,
            consumer_tag,
        })
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<bool> {
        self.ensure_open("unsubscribe")?;
        let mut state = self.inner.state.lock().await;
        let Some(queue_name) = state.consumer_queues.remove(consumer_tag) else {
            return Ok(false);
        };

        let remove_queue = match state.queues.get_mut(&queue_name) {
            Some(queue) => {
                queue.consumers.retain(|slot| slot.tag != consumer_tag);
                queue.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if remove_queue {
            state.queues.remove(&queue_name);
            state.bindings.retain(|b| b.queue != queue_name);
            debug!(target: "memory_broker", queue = %queue_name, "Auto-deleted queue");
        }
        drop(state);

        self.inner.counters.cancels.fetch_add(1, Ordering::Relaxed);
        info!(target: "memory_broker", %consumer_tag, queue = %queue_name, "Consumer cancelled");
        Ok(true)
    }

    async fn send_message(&self, publish: Publish) -> Result<()> {
        self.ensure_open("sendMessage")?;
        if self.inner.faults.reject_publish.load(Ordering::Relaxed) {
            return Err(MqError::broker("memory_broker.sendMessage", "publish rejected"));
        }
        self.inner.counters.publishes.fetch_add(1, Ordering::Relaxed);

        let Publish {
            destination,
            message,
            options,
        } = publish;
        let mut state = self.inner.state.lock().await;

        let (targets, topic) = if destination.exchange.is_empty() {
            (vec![destination.queue.clone()], String::new())
        } else {
            let key = destination.routing_key().to_string();
            let mut targets: Vec<String> = Vec::new();
            for b in &state.bindings {
                if b.exchange == destination.exchange
                    && topic_matches(&b.pattern, &key)
                    && !targets.contains(&b.queue)
                {
                    targets.push(b.queue.clone());
                }
            }
            (targets, key)
        };

        let now = Instant::now();
        let mut routed = 0u64;
        let mut expired = 0u64;
        for name in &targets {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            routed += 1;
            expired += queue.purge_expired(now);
            let delivery = Delivery {
                message: message.clone(),
                queue: name.clone(),
                topic: topic.clone(),
                exchange: destination.exchange.clone(),
                consumer_tag: String::new(),
            };
            if let Some(unclaimed) = queue.dispatch(delivery) {
                queue.backlog.push_back(Buffered {
                    message: unclaimed.message,
                    topic: unclaimed.topic,
                    exchange: unclaimed.exchange,
                    expires_at: now + options.ttl,
                });
            } else {
                self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(state);

        if expired > 0 {
            self.inner.counters.dropped.fetch_add(expired, Ordering::Relaxed);
            debug!(target: "memory_broker", expired, "Expired backlog entries dropped");
        }
        if routed == 0 {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(target: "memory_broker", queue = %destination.queue, topic = %destination.topic, exchange = %destination.exchange, "Unroutable message dropped");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        // dropping the senders ends every consumer task
        state.queues.clear();
        state.bindings.clear();
        state.consumer_queues.clear();
        info!(target: "memory_broker", "Broker closed");
        Ok(())
    }
}

/// AMQP topic matching over dot-separated words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
