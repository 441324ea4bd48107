use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the router, its routing tables, codecs and connectors.
///
/// Every variant names the operation that failed in `origin`
/// (`"<router>.MQRouter.sendMessage"`, `"<router>.RequestsRoutingTable.callById"`, ...).
/// Wrapping variants keep the underlying failure in `cause`; use
/// [`MqError::root_cause`] to reach the innermost one.
///
/// The type is `Clone` so that one failure (a failed self-subscription, a
/// rejected publish) can be handed to every waiter that shares it.
#[derive(Error, Debug, Clone)]
pub enum MqError {
    #[error("{origin}: destination needs a queue, or a topic together with an exchange")]
    ValidateDestination { origin: String },

    #[error("{origin}: failed to build request: {cause}")]
    BuildRequestError { origin: String, cause: Arc<MqError> },

    #[error("{origin}: failed to send message: {cause}")]
    SendMessageError { origin: String, cause: Arc<MqError> },

    #[error("{origin}: failed to send request: {cause}")]
    SendRequestError { origin: String, cause: Arc<MqError> },

    #[error("{origin}: broker refused the message: {cause}")]
    SendMQMsg { origin: String, cause: Arc<MqError> },

    #[error("{origin}: subscribe failed: {cause}")]
    Subscribe { origin: String, cause: Arc<MqError> },

    #[error("{origin}: unsubscribe failed: {cause}")]
    Unsubscribe { origin: String, cause: Arc<MqError> },

    #[error("{origin}: self subscription failed: {cause}")]
    SelfSubscribe { origin: String, cause: Arc<MqError> },

    #[error("{origin}: unknown registration index {index}")]
    UnknownIndex { origin: String, index: u64 },

    #[error("{origin}: unknown consumer tag {consumer_tag}")]
    UnknownConsumerTag { origin: String, consumer_tag: String },

    #[error("{origin}: no pending request for message id {id}")]
    UnknownMessageId { origin: String, id: String },

    #[error("{origin}: failed to consume message: {cause}")]
    ConsumeError { origin: String, cause: Arc<MqError> },

    #[error("{origin}: unknown message type (version tag {tag:?})")]
    UnknownMessageType { origin: String, tag: Option<u8> },

    #[error("{origin}: failed to route message: {cause}")]
    RoutingError { origin: String, cause: Arc<MqError> },

    #[error("{origin}: request {id} timed out")]
    MessageTimeout { origin: String, id: String },

    #[error("{origin}: received a direct message but no default handler is configured")]
    OwnHandlerMissing { origin: String },

    #[error("{origin}: closed")]
    Closed { origin: String },

    #[error("{origin}: codec error: {message}")]
    Codec { origin: String, message: String },

    #[error("{origin}: broker error: {message}")]
    Broker { origin: String, message: String },

    #[error("{origin}: handler error: {message}")]
    Handler { origin: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MqError>;

impl MqError {
    /// Connector-level failure.
    pub fn broker(origin: impl Into<String>, message: impl Into<String>) -> Self {
        MqError::Broker {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Failure raised by application handler code.
    pub fn handler(message: impl Into<String>) -> Self {
        MqError::Handler {
            origin: "handler".to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn codec(origin: impl Into<String>, message: impl ToString) -> Self {
        MqError::Codec {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    /// Operation that raised this error.
    pub fn origin(&self) -> &str {
        match self {
            MqError::ValidateDestination { origin }
            | MqError::BuildRequestError { origin, .. }
            | MqError::SendMessageError { origin, .. }
            | MqError::SendRequestError { origin, .. }
            | MqError::SendMQMsg { origin, .. }
            | MqError::Subscribe { origin, .. }
            | MqError::Unsubscribe { origin, .. }
            | MqError::SelfSubscribe { origin, .. }
            | MqError::UnknownIndex { origin, .. }
            | MqError::UnknownConsumerTag { origin, .. }
            | MqError::UnknownMessageId { origin, .. }
            | MqError::ConsumeError { origin, .. }
            | MqError::UnknownMessageType { origin, .. }
            | MqError::RoutingError { origin, .. }
            | MqError::MessageTimeout { origin, .. }
            | MqError::OwnHandlerMissing { origin }
            | MqError::Closed { origin }
            | MqError::Codec { origin, .. }
            | MqError::Broker { origin, .. }
            | MqError::Handler { origin, .. } => origin,
            MqError::Config(_) => "config",
        }
    }

    /// Directly wrapped error, if this variant wraps one.
    pub fn cause(&self) -> Option<&MqError> {
        match self {
            MqError::BuildRequestError { cause, .. }
            | MqError::SendMessageError { cause, .. }
            | MqError::SendRequestError { cause, .. }
            | MqError::SendMQMsg { cause, .. }
            | MqError::Subscribe { cause, .. }
            | MqError::Unsubscribe { cause, .. }
            | MqError::SelfSubscribe { cause, .. }
            | MqError::ConsumeError { cause, .. }
            | MqError::RoutingError { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Innermost error of the wrapping chain.
    pub fn root_cause(&self) -> &MqError {
        let mut current = self;
        while let Some(inner) = current.cause() {
            current = inner;
        }
        current
    }

    /// Stable identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            MqError::ValidateDestination { .. } => "MQ_ROUTER_VALIDATE_DESTINATION",
            MqError::BuildRequestError { .. } => "MQ_ROUTER_BUILD_REQUEST_ERROR",
            MqError::SendMessageError { .. } => "MQ_ROUTER_SEND_MESSAGE_ERROR",
            MqError::SendRequestError { .. } => "MQ_ROUTER_SEND_REQUEST_ERROR",
            MqError::SendMQMsg { .. } => "MQ_ROUTER_SEND_MQ_MSG",
            MqError::Subscribe { .. } => "MQ_ROUTER_SUBSCRIBE",
            MqError::Unsubscribe { .. } => "MQ_ROUTER_UNSUBSCRIBE",
            MqError::SelfSubscribe { .. } => "MQ_ROUTER_SELF_SUBSCRIBE",
            MqError::UnknownIndex { .. } => "MQ_ROUTING_TABLE_UNKNOWN_INDEX",
            MqError::UnknownConsumerTag { .. } => "MQ_ROUTING_TABLE_UNKNOWN_CONSUMER_TAG",
            MqError::UnknownMessageId { .. } => "MQ_ROUTER_UNKNOWN_MESSAGE_ID",
            MqError::ConsumeError { .. } => "MQ_ROUTER_CONSUME_ERROR",
            MqError::UnknownMessageType { .. } => "MQ_ROUTER_UNKNOWN_MESSAGE_TYPE",
            MqError::RoutingError { .. } => "MQ_ROUTER_ROUTING_ERROR",
            MqError::MessageTimeout { .. } => "MQ_ROUTER_MESSAGE_TIMEOUT",
            MqError::OwnHandlerMissing { .. } => "MQ_ROUTER_OWN_HANDLER",
            MqError::Closed { .. } => "MQ_ROUTER_CLOSED",
            MqError::Codec { .. } => "MQ_ROUTER_CODEC",
            MqError::Broker { .. } => "MQ_ROUTER_BROKER",
            MqError::Handler { .. } => "MQ_ROUTER_HANDLER",
            MqError::Config(_) => "MQ_ROUTER_CONFIG",
        }
    }
}

/// Builds a wrapping variant around `cause`.
macro_rules! wrap_err {
    ($variant:ident, $origin:expr, $cause:expr) => {
        $crate::error::MqError::$variant {
            origin: $origin.into(),
            cause: ::std::sync::Arc::new($cause),
        }
    };
}
pub(crate) use wrap_err;
