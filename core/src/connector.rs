//! Broker connector contract.
//!
//! A connector owns the broker connection. The router only ever talks to it
//! through [`Connector`]; inbound traffic comes back through the
//! [`DeliveryConsumer`] handed over on `subscribe`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::Destination;
use crate::error::Result;

/// Queue and consumer options passed through to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries in flight per consumer; 0 is unbounded.
    pub prefetch: u16,
    /// Remove the queue, and its bindings, with its last consumer.
    pub auto_delete: bool,
    /// Refuse any other consumer on the queue while this one is attached.
    pub exclusive: bool,
    /// Ask the broker to keep the queue across restarts. The in-memory
    /// broker has nothing to restart and ignores it.
    pub durable: bool,
    /// When false, subscribing again to an identical (queue, topic, exchange)
    /// shares the existing subscription instead of creating a consumer.
    pub allow_duplicate: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch: 0,
            auto_delete: true,
            exclusive: false,
            durable: false,
            allow_duplicate: true,
        }
    }
}

/// One message handed to a consumer by the connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Raw frame as published.
    pub message: Vec<u8>,
    /// Queue the message was taken from.
    pub queue: String,
    /// Routing key the message was published with.
    pub topic: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Consumer the broker handed the message to.
    pub consumer_tag: String,
}

/// Receives deliveries for one subscription. Fire-and-forget from the
/// connector's point of view: errors are the consumer's to report.
#[async_trait]
pub trait DeliveryConsumer: Send + Sync {
    async fn deliver(&self, delivery: Delivery);
}

/// Everything a connector needs to open one consumer.
pub struct SubscribeRequest {
    /// Queue to consume, with the topic and exchange to bind it to.
    pub destination: Destination,
    pub options: SubscribeOptions,
    /// Receives every delivery of the new consumer.
    pub consumer: Arc<dyn DeliveryConsumer>,
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("destination", &self.destination)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Broker confirmation of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    /// Actual queue name; server-generated when an empty name was requested.
    pub queue: String,
    /// Identifies the consumer in `unsubscribe`.
    pub consumer_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Message expiration on the broker.
    pub ttl: Duration,
}

/// One outgoing broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub destination: Destination,
    /// Encoded envelope frame.
    pub message: Vec<u8>,
    pub options: PublishOptions,
}

/// Trait implemented by concrete broker connectors.
///
/// Deliveries may reach the consumer before `subscribe` returns; each
/// consumer is bound to its registration from the start, so they are
/// routed like any other.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeAck>;

    /// Cancels a consumer. Returns false when the tag is unknown.
    async fn unsubscribe(&self, consumer_tag: &str) -> Result<bool>;

    /// Resolves once the broker has accepted the message (not delivered it).
    async fn send_message(&self, publish: Publish) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
