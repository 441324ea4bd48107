// MQ Router Core Library
// Request/reply correlation over a pub/sub message broker

pub mod broker;
pub mod codec;
pub mod config;
pub mod connector;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod ids;
pub mod queues;
pub mod requests;
pub mod router;
pub mod telemetry;

// Export core types
pub use broker::{BrokerStats, InMemoryBroker};
pub use codec::{Decoded, EnvelopeCodec, Serializer, WireVersion};
pub use config::RouterConfig;
pub use connector::{
    Connector, Delivery, DeliveryConsumer, Publish, PublishOptions, SubscribeAck,
    SubscribeOptions, SubscribeRequest,
};
pub use envelope::{Destination, Envelope};
pub use error::{MqError, Result};
pub use handler::{
    handler_fn, ErrorCollector, ErrorReport, HandlerReply, IncomingMessage, MessageHandler, Reply,
};
pub use queues::{HandlerRefs, QueuesRoutingTable, Registered, RegistrationIndex};
pub use requests::{PendingReply, RequestsRoutingTable};
pub use router::{Router, RouterBuilder, SendOptions};
