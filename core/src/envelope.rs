use serde::{Deserialize, Serialize};

/// Where a message is published to, or where replies should arrive.
///
/// A destination is addressable when it names a queue, or when it names a
/// topic together with the exchange the topic is bound on. Empty strings mean
/// "not set"; an empty exchange is the broker's default exchange.
///
/// # Examples
///
/// ```
/// use mq_router_core::Destination;
///
/// assert!(Destination::queue("work").is_valid());
/// assert!(Destination::topic("events", "orders.created").is_valid());
/// assert!(!Destination::default().is_valid());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Destination {
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub exchange: String,
}

impl Destination {
    pub fn new(
        queue: impl Into<String>,
        topic: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            topic: topic.into(),
            exchange: exchange.into(),
        }
    }

    /// A queue on the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// A topic bound on `exchange`.
    pub fn topic(exchange: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            exchange: exchange.into(),
            ..Default::default()
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.queue.is_empty() || (!self.topic.is_empty() && !self.exchange.is_empty())
    }

    /// Key the broker routes on: the topic when it is bound on an exchange,
    /// otherwise the queue name.
    pub fn routing_key(&self) -> &str {
        if !self.topic.is_empty() && !self.exchange.is_empty() {
            &self.topic
        } else {
            &self.queue
        }
    }
}

/// Versioned wrapper around every message the router puts on the broker.
///
/// * `id` - unique per sending router (`"<name>.<nanos>"`)
/// * `reply_to` - id of the request this message answers; empty when it is
///   not a reply
/// * `reply_on` - where the sender wants replies delivered
/// * `from`, `to` - free-form routing hints
/// * `timestamp_ms` - creation time in milliseconds since the Unix epoch
/// * `payload` - opaque application bytes
///
/// Envelopes are built once by the router and never mutated afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub reply_on: Destination,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(rename = "timestamp", default)]
    pub timestamp_ms: i64,
    #[serde(rename = "message", default)]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(id: impl Into<String>, from: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    pub fn with_reply_on(mut self, reply_on: Destination) -> Self {
        self.reply_on = reply_on;
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    /// True when this message answers one of the receiver's requests.
    pub fn is_reply(&self) -> bool {
        !self.reply_to.is_empty()
    }
}
