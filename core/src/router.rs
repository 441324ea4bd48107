//! Request/reply router.
//!
//! A [`Router`] sends fire-and-forget messages and correlated requests over a
//! [`Connector`], and dispatches inbound deliveries to the handler registered
//! for their consumer tag. Replies to this router's own requests arrive on
//! its listen queue, which is subscribed lazily on the first request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{Decoded, EnvelopeCodec, Serializer, WireVersion};
use crate::config::RouterConfig;
use crate::connector::{
    Connector, Delivery, DeliveryConsumer, Publish, PublishOptions, SubscribeOptions,
    SubscribeRequest,
};
use crate::envelope::{Destination, Envelope};
use crate::error::{wrap_err, MqError, Result};
use crate::handler::{ErrorCollector, ErrorReport, HandlerReply, IncomingMessage, MessageHandler, Reply};
use crate::ids::MessageIdGenerator;
use crate::queues::{QueuesRoutingTable, RegistrationIndex};
use crate::requests::RequestsRoutingTable;

/// Per-call overrides for `send_message` and `send_request`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Broker expiration, and for requests the reply deadline. Defaults to the
    /// router's `default_ttl_secs`.
    pub ttl: Option<Duration>,
    /// Envelope version to encode with. Defaults to the router's `wire_version`.
    pub version: Option<WireVersion>,
    /// Routing hint copied into the envelope.
    pub to: String,
}

impl SendOptions {
    /// Options with only the ttl overridden.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use mq_router_core::SendOptions;
    ///
    /// let options = SendOptions::with_ttl(Duration::from_millis(500));
    /// assert_eq!(options.ttl, Some(Duration::from_millis(500)));
    /// assert!(options.version.is_none());
    /// ```
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }
}

type SelfSubscribeOutcome = Option<Result<Destination>>;

enum SelfSubscription {
    Idle,
    Subscribing(watch::Receiver<SelfSubscribeOutcome>),
    Subscribed(Destination),
}

struct RouterInner {
    name: String,
    default_ttl: Duration,
    wire_version: WireVersion,
    connector: Arc<dyn Connector>,
    serializer: Arc<dyn Serializer>,
    ids: MessageIdGenerator,
    listen: Destination,
    queues: Mutex<QueuesRoutingTable>,
    // serializes subscribe and unsubscribe; dispatch never takes it
    membership: Mutex<()>,
    requests: RequestsRoutingTable,
    gate: Mutex<SelfSubscription>,
    return_destination: RwLock<Option<Destination>>,
    default_handler: Option<Arc<dyn MessageHandler>>,
    error_collector: Option<Arc<dyn ErrorCollector>>,
    errors: broadcast::Sender<ErrorReport>,
    closed: AtomicBool,
}

type ConnectorFactory = Box<dyn FnOnce(&RouterConfig) -> Result<Arc<dyn Connector>> + Send>;

enum ConnectorSource {
    Ready(Arc<dyn Connector>),
    Factory(ConnectorFactory),
}

/// Builder for [`Router`].
///
/// A connector is required, either ready-made through
/// [`connector`](Self::connector) or built from the configuration through
/// [`connector_from`](Self::connector_from).
pub struct RouterBuilder {
    config: RouterConfig,
    connector: Option<ConnectorSource>,
    serializer: Option<Arc<dyn Serializer>>,
    default_handler: Option<Arc<dyn MessageHandler>>,
    error_collector: Option<Arc<dyn ErrorCollector>>,
}

impl RouterBuilder {
    /// Uses an already connected `connector`.
    ///
    /// # Arguments
    ///
    /// * `connector` - Broker connection shared by every subscription and
    ///   publish of the router
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(ConnectorSource::Ready(connector));
        self
    }

    /// Builds the connector from the validated configuration at `build()`
    /// time, so it sees `mq_uri` and `connector_options`.
    ///
    /// # Arguments
    ///
    /// * `make` - Called once with the router configuration; its error is
    ///   returned by `build()`
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use mq_router_core::{Connector, InMemoryBroker, Router, RouterConfig};
    ///
    /// let router = Router::builder(RouterConfig::new("billing"))
    ///     .connector_from(|config| {
    ///         let broker: Arc<dyn Connector> = Arc::new(InMemoryBroker::connect(config)?);
    ///         Ok(broker)
    ///     })
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(router.name(), "billing");
    /// ```
    pub fn connector_from<F>(mut self, make: F) -> Self
    where
        F: FnOnce(&RouterConfig) -> Result<Arc<dyn Connector>> + Send + 'static,
    {
        self.connector = Some(ConnectorSource::Factory(Box::new(make)));
        self
    }

    /// Replaces the default [`EnvelopeCodec`].
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Handler for messages sent directly to this router that are not
    /// replies to its requests.
    pub fn default_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// Receives every inbound failure synchronously, before it is broadcast
    /// on [`Router::errors`].
    pub fn error_collector(mut self, collector: Arc<dyn ErrorCollector>) -> Self {
        self.error_collector = Some(collector);
        self
    }

    /// Validates the configuration and assembles the router. No broker call
    /// is made; the listen queue is subscribed on the first request.
    pub fn build(self) -> Result<Router> {
        let config = self.config;
        config.validate()?;
        let connector = match self.connector {
            Some(ConnectorSource::Ready(connector)) => connector,
            Some(ConnectorSource::Factory(make)) => make(&config)?,
            None => return Err(MqError::Config("a connector is required".into())),
        };
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(EnvelopeCodec::new()));

        let ids = MessageIdGenerator::new(&config.name);
        let mut listen = config.listen_destination();
        if listen.queue.is_empty() {
            listen.queue = ids.listen_queue_name();
        }
        let (errors, _) = broadcast::channel(config.error_channel_capacity);

        info!(
            target: "mq_router",
            router = %config.name,
            listen_queue = %listen.queue,
            ttl_secs = config.default_ttl_secs,
            version = ?config.wire_version,
            "Router created"
        );

        Ok(Router {
            inner: Arc::new(RouterInner {
                default_ttl: config.default_ttl(),
                wire_version: config.wire_version,
                connector,
                serializer,
                ids,
                listen,
                queues: Mutex::new(QueuesRoutingTable::new(&config.name)),
                membership: Mutex::new(()),
                requests: RequestsRoutingTable::new(&config.name, config.sweep_interval()),
                gate: Mutex::new(SelfSubscription::Idle),
                return_destination: RwLock::new(None),
                default_handler: self.default_handler,
                error_collector: self.error_collector,
                errors,
                closed: AtomicBool::new(false),
                name: config.name,
            }),
        })
    }
}

/// Cheap to clone; clones share one router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Starts a [`RouterBuilder`] for `config`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use mq_router_core::{InMemoryBroker, Router, RouterConfig};
    ///
    /// let router = Router::builder(RouterConfig::new("orders"))
    ///     .connector(Arc::new(InMemoryBroker::new()))
    ///     .build()
    ///     .unwrap();
    /// assert!(router.listen_destination().queue.starts_with("orders-"));
    /// ```
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            connector: None,
            serializer: None,
            default_handler: None,
            error_collector: None,
        }
    }

    /// Configured router name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Own listen destination as configured, before broker confirmation.
    pub fn listen_destination(&self) -> &Destination {
        &self.inner.listen
    }

    /// Where peers send replies; `None` until self-subscribed.
    pub async fn return_destination(&self) -> Option<Destination> {
        self.inner.return_destination.read().await.clone()
    }

    /// Receives every inbound failure from the moment of the call.
    pub fn errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.inner.errors.subscribe()
    }

    /// Publishes `message` without expecting a reply. Resolves once the
    /// connector has accepted it.
    pub async fn send_message(
        &self,
        message: Vec<u8>,
        destination: &Destination,
        options: SendOptions,
    ) -> Result<()> {
        let origin = self.inner.origin("sendMessage");
        self.inner
            .send_message(message, destination, options, &origin)
            .await
            .map_err(|e| wrap_err!(SendMessageError, origin, e))
    }

    /// Publishes `message` and waits for the correlated reply, failing with
    /// a `MessageTimeout` root cause once the ttl has elapsed.
    pub async fn send_request(
        &self,
        message: Vec<u8>,
        destination: &Destination,
        options: SendOptions,
    ) -> Result<Reply> {
        let origin = self.inner.origin("sendRequest");
        self.inner
            .send_request(message, destination, options, &origin)
            .await
            .map_err(|e| wrap_err!(SendRequestError, origin, e))
    }

    /// Routes deliveries on `destination` to `handler`. Returns the
    /// broker-confirmed destination, which is what `unsubscribe` expects.
    pub async fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
        destination: Destination,
        options: SubscribeOptions,
    ) -> Result<Destination> {
        self.inner.subscribe(handler, destination, options).await
    }

    /// Removes one subscription to `destination`. Returns false when nothing
    /// is subscribed there.
    pub async fn unsubscribe(&self, destination: &Destination) -> Result<bool> {
        self.inner.unsubscribe(destination).await
    }

    /// Subscribes the listen destination if that has not happened yet, and
    /// returns the return destination.
    pub async fn ensure_self_subscribed(&self) -> Result<Destination> {
        self.inner.ensure_self_subscribed().await
    }

    /// Closes the connector and fails every pending request with `Closed`.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl RouterInner {
    fn origin(&self, op: &str) -> String {
        format!("{}.MQRouter.{op}", self.name)
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::Closed {
                origin: self.origin(op),
            });
        }
        Ok(())
    }

    async fn send_message(
        &self,
        message: Vec<u8>,
        destination: &Destination,
        options: SendOptions,
        origin: &str,
    ) -> Result<()> {
        self.ensure_open("sendMessage")?;
        if !destination.is_valid() {
            return Err(MqError::ValidateDestination {
                origin: origin.to_string(),
            });
        }
        let version = options.version.unwrap_or(self.wire_version);
        let (envelope, bytes) = self.build_request(message, "", &options.to, version).await?;
        self.send_mq_msg(bytes, destination, options.ttl.unwrap_or(self.default_ttl))
            .await?;
        debug!(target: "mq_router", router = %self.name, id = %envelope.id, queue = %destination.queue, topic = %destination.topic, "Message sent");
        Ok(())
    }

    async fn send_request(
        self: &Arc<Self>,
        message: Vec<u8>,
        destination: &Destination,
        options: SendOptions,
        origin: &str,
    ) -> Result<Reply> {
        self.ensure_open("sendRequest")?;
        if !destination.is_valid() {
            return Err(MqError::ValidateDestination {
                origin: origin.to_string(),
            });
        }
        self.ensure_self_subscribed().await?;

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let version = options.version.unwrap_or(self.wire_version);
        let (envelope, bytes) = self.build_request(message, "", &options.to, version).await?;

        // registered before publishing, so a fast reply always finds its entry
        let pending = self.requests.register(envelope.id.clone(), ttl)?;
        if let Err(e) = self.send_mq_msg(bytes, destination, ttl).await {
            let _ = self.requests.call_by_id(&envelope.id, Err(e));
        }
        debug!(target: "mq_router", router = %self.name, id = %envelope.id, ttl_ms = ttl.as_millis() as u64, "Request sent");
        pending.await
    }

    /// Wraps `payload` in a fresh envelope answering `reply_to` and encodes it.
    async fn build_request(
        &self,
        payload: Vec<u8>,
        reply_to: &str,
        to: &str,
        version: WireVersion,
    ) -> Result<(Envelope, Vec<u8>)> {
        // before self-subscription only the listen exchange is known
        let reply_on = self
            .return_destination
            .read()
            .await
            .clone()
            .unwrap_or_else(|| Destination {
                exchange: self.listen.exchange.clone(),
                ..Default::default()
            });
        let envelope = Envelope::new(self.ids.next_id(), &self.name, payload)
            .with_reply_to(reply_to)
            .with_reply_on(reply_on)
            .with_to(to);
        let bytes = self
            .serializer
            .encode(&envelope, version)
            .map_err(|e| wrap_err!(BuildRequestError, self.origin("buildRequest"), e))?;
        Ok((envelope, bytes))
    }

    async fn send_mq_msg(&self, message: Vec<u8>, destination: &Destination, ttl: Duration) -> Result<()> {
        self.connector
            .send_message(Publish {
                destination: destination.clone(),
                message,
                options: PublishOptions { ttl },
            })
            .await
            .map_err(|e| wrap_err!(SendMQMsg, self.origin("sendMQMsg"), e))
    }

    async fn subscribe(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        destination: Destination,
        options: SubscribeOptions,
    ) -> Result<Destination> {
        let origin = self.origin("subscribe");
        self.ensure_open("subscribe")
            .map_err(|e| wrap_err!(Subscribe, origin.clone(), e))?;

        let _membership = self.membership.lock().await;
        let registered = {
            let mut table = self.queues.lock().await;
            let registered = table.register(handler, &destination, options.allow_duplicate);
            if registered.shared {
                let existing = table.handler_by_index(registered.index)?;
                return Ok(Destination::new(&existing.queue, &existing.topic, &existing.exchange));
            }
            registered
        };

        // deliveries resolve by index, so they find the handler before `update`
        let consumer: Arc<dyn DeliveryConsumer> = Arc::new(RouterConsumer {
            router: Arc::downgrade(self),
            index: registered.index,
        });
        let request = SubscribeRequest {
            destination: destination.clone(),
            options,
            consumer,
        };
        let outcome = self.connector.subscribe(request).await;

        let mut table = self.queues.lock().await;
        match outcome {
            Ok(ack) => {
                table.update(registered.index, ack.queue.clone(), ack.consumer_tag.clone())?;
                info!(target: "mq_router", router = %self.name, index = %registered.index, queue = %ack.queue, consumer_tag = %ack.consumer_tag, "Subscribed");
                Ok(Destination::new(ack.queue, destination.topic, destination.exchange))
            }
            Err(e) => {
                table.unregister(registered.index);
                warn!(target: "mq_router", router = %self.name, queue = %destination.queue, error = %e, "Subscribe failed");
                Err(wrap_err!(Subscribe, origin, e))
            }
        }
    }

    async fn unsubscribe(&self, destination: &Destination) -> Result<bool> {
        let _membership = self.membership.lock().await;
        let (index, consumer_tag) = {
            let mut table = self.queues.lock().await;
            let refs = table.handler_refs_by_properties(
                &destination.queue,
                &destination.topic,
                &destination.exchange,
            );
            let (Some(index), Some(consumer_tag)) = (refs.index, refs.consumer_tag) else {
                return Ok(false);
            };
            if table.ref_count(index).unwrap_or(0) > 0 {
                // other subscribers still use the consumer
                table.unregister(index);
                return Ok(true);
            }
            (index, consumer_tag)
        };

        self.connector
            .unsubscribe(&consumer_tag)
            .await
            .map_err(|e| wrap_err!(Unsubscribe, self.origin("unsubscribe"), e))?;
        self.queues.lock().await.unregister(index);
        info!(target: "mq_router", router = %self.name, %consumer_tag, "Unsubscribed");

        // removing our own listen queue means the next request must resubscribe
        let mut gate = self.gate.lock().await;
        if matches!(&*gate, SelfSubscription::Subscribed(own) if own == destination) {
            *gate = SelfSubscription::Idle;
            *self.return_destination.write().await = None;
        }
        Ok(true)
    }

    async fn ensure_self_subscribed(self: &Arc<Self>) -> Result<Destination> {
        let mut outcome = {
            let mut gate = self.gate.lock().await;
            let in_flight = match &*gate {
                SelfSubscription::Subscribed(own) => return Ok(own.clone()),
                // a closed channel means the bootstrap task died; start over
                SelfSubscription::Subscribing(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
                _ => None,
            };
            match in_flight {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    *gate = SelfSubscription::Subscribing(rx.clone());
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = inner.self_subscribe().await;
                        *inner.gate.lock().await = match &result {
                            Ok(own) => SelfSubscription::Subscribed(own.clone()),
                            Err(_) => SelfSubscription::Idle,
                        };
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let closed = || MqError::Closed {
            origin: self.origin("selfSubscribe"),
        };
        let settled = outcome.wait_for(Option::is_some).await.map_err(|_| closed())?;
        (*settled).clone().unwrap_or_else(|| Err(closed()))
    }

    async fn self_subscribe(self: &Arc<Self>) -> Result<Destination> {
        let own_handler: Arc<dyn MessageHandler> = Arc::new(OwnHandler {
            router: Arc::downgrade(self),
        });
        let options = SubscribeOptions {
            prefetch: 0,
            exclusive: true,
            ..Default::default()
        };
        let own = self
            .subscribe(own_handler, self.listen.clone(), options)
            .await
            .map_err(|e| wrap_err!(SelfSubscribe, self.origin("selfSubscribe"), e))?;

        *self.return_destination.write().await = Some(own.clone());
        info!(target: "mq_router", router = %self.name, queue = %own.queue, topic = %own.topic, exchange = %own.exchange, "Self-subscribed");
        Ok(own)
    }

    async fn consume_messages(&self, index: RegistrationIndex, delivery: Delivery) {
        let decoded = match self.serializer.decode(&delivery.message) {
            Ok(decoded) => decoded,
            Err(e) => {
                let error = wrap_err!(ConsumeError, self.origin("consumeMessages"), e);
                self.report(error, None, &delivery);
                return;
            }
        };
        if let Err(e) = self.route_message(index, &decoded, &delivery).await {
            let error = wrap_err!(RoutingError, self.origin("routeMessage"), e);
            self.report(error, Some(decoded.envelope), &delivery);
        }
    }

    async fn route_message(
        &self,
        index: RegistrationIndex,
        decoded: &Decoded,
        delivery: &Delivery,
    ) -> Result<()> {
        let handler = {
            let table = self.queues.lock().await;
            Arc::clone(&table.handler_by_index(index)?.handler)
        };
        let envelope = &decoded.envelope;
        let message = IncomingMessage {
            id: envelope.id.clone(),
            from: envelope.from.clone(),
            message: envelope.payload.clone(),
            reply_to: envelope.reply_to.clone(),
            queue: delivery.queue.clone(),
            topic: delivery.topic.clone(),
            exchange: delivery.exchange.clone(),
            consumer_tag: delivery.consumer_tag.clone(),
        };

        let HandlerReply { message: reply } = handler.handle(message).await?;
        let Some(reply) = reply else {
            return Ok(());
        };
        if !envelope.reply_on.is_valid() {
            return Err(MqError::ValidateDestination {
                origin: self.origin("routeMessage"),
            });
        }
        // answer in the version the request was written in
        let (answer, bytes) = self
            .build_request(reply, &envelope.id, &envelope.from, decoded.version)
            .await?;
        self.send_mq_msg(bytes, &envelope.reply_on, self.default_ttl).await?;
        debug!(target: "mq_router", router = %self.name, id = %answer.id, reply_to = %envelope.id, "Reply sent");
        Ok(())
    }

    fn report(&self, error: MqError, envelope: Option<Envelope>, delivery: &Delivery) {
        warn!(
            target: "mq_router",
            router = %self.name,
            code = error.code(),
            consumer_tag = %delivery.consumer_tag,
            error = %error,
            "Inbound message failed"
        );
        let report = ErrorReport {
            error,
            envelope,
            queue: delivery.queue.clone(),
            topic: delivery.topic.clone(),
            exchange: delivery.exchange.clone(),
            consumer_tag: delivery.consumer_tag.clone(),
        };
        if let Some(collector) = &self.error_collector {
            collector.collect(&report);
        }
        // no receivers is fine
        let _ = self.errors.send(report);
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.connector.close().await;
        self.requests.close();
        info!(target: "mq_router", router = %self.name, "Router closed");
        result
    }
}

/// Connector-facing end of one registration.
struct RouterConsumer {
    router: Weak<RouterInner>,
    index: RegistrationIndex,
}

#[async_trait]
impl DeliveryConsumer for RouterConsumer {
    async fn deliver(&self, delivery: Delivery) {
        if let Some(router) = self.router.upgrade() {
            router.consume_messages(self.index, delivery).await;
        }
    }
}

/// Handler of the router's own listen queue: completes pending requests and
/// forwards anything else to the default handler.
struct OwnHandler {
    router: Weak<RouterInner>,
}

#[async_trait]
impl MessageHandler for OwnHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<HandlerReply> {
        let Some(router) = self.router.upgrade() else {
            return Err(MqError::Closed {
                origin: "MQRouter.ownHandler".into(),
            });
        };

        if message.reply_to.is_empty() {
            return match &router.default_handler {
                Some(handler) => handler.handle(message).await,
                None => Err(MqError::OwnHandlerMissing {
                    origin: router.origin("ownHandler"),
                }),
            };
        }

        let reply = Reply {
            message: message.message,
            from: message.from,
            queue: message.queue,
            topic: message.topic,
            exchange: message.exchange,
        };
        router.requests.call_by_id(&message.reply_to, Ok(reply))?;
        Ok(HandlerReply::none())
    }
}
