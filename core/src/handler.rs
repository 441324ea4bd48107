// Application-facing callbacks: message handlers and error collectors
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::{MqError, Result};

/// A message delivered to an application handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Envelope id of the message.
    pub id: String,
    /// Sender name, as stamped by the sending router.
    pub from: String,
    /// Application payload.
    pub message: Vec<u8>,
    /// Id of the request this message answers; empty for plain messages.
    pub reply_to: String,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Routing key it was published with, empty on the default exchange.
    pub topic: String,
    pub exchange: String,
    /// Broker consumer that received it.
    pub consumer_tag: String,
}

/// What a handler wants sent back to the message's sender.
///
/// `message: None` means no reply is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerReply {
    /// Reply payload.
    pub message: Option<Vec<u8>>,
}

impl HandlerReply {
    /// No reply.
    pub fn none() -> Self {
        Self { message: None }
    }

    /// Reply with `message`, sent to the request's `reply_on` destination.
    pub fn with(message: impl Into<Vec<u8>>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

impl From<Vec<u8>> for HandlerReply {
    fn from(message: Vec<u8>) -> Self {
        Self::with(message)
    }
}

/// The answer to a `send_request`, with the delivery it arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Reply payload.
    pub message: Vec<u8>,
    /// Name of the router that answered.
    pub from: String,
    /// Own listen queue the reply was consumed from.
    pub queue: String,
    pub topic: String,
    pub exchange: String,
}

/// Handler trait for subscribed queues
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<HandlerReply>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerReply>> + Send + 'static,
{
    async fn handle(&self, message: IncomingMessage) -> Result<HandlerReply> {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// ```
/// use mq_router_core::{handler_fn, HandlerReply};
///
/// let echo = handler_fn(|msg| async move { Ok(HandlerReply::with(msg.message)) });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReply>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// An error found while processing inbound traffic, which has no caller to
/// be returned to.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// The failure, wrapped as `ConsumeError` or `RoutingError`.
    pub error: MqError,
    /// Decoded envelope, when decoding got that far.
    pub envelope: Option<Envelope>,
    /// Delivery the failure happened on.
    pub queue: String,
    pub topic: String,
    pub exchange: String,
    pub consumer_tag: String,
}

/// Sink for asynchronous routing and consume errors.
pub trait ErrorCollector: Send + Sync {
    fn collect(&self, report: &ErrorReport);
}

impl<F> ErrorCollector for F
where
    F: Fn(&ErrorReport) + Send + Sync,
{
    fn collect(&self, report: &ErrorReport) {
        self(report)
    }
}
