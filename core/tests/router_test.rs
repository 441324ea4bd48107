use std::sync::Arc;
use std::time::Duration;

use mq_router_core::{
    handler_fn, Connector, Destination, EnvelopeCodec, HandlerReply, InMemoryBroker, MqError,
    Publish, PublishOptions, Router, RouterConfig, SendOptions, SubscribeOptions, WireVersion,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn router(broker: &InMemoryBroker, name: &str) -> Router {
    Router::builder(RouterConfig::new(name))
        .connector(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

async fn serve_pong(b: &Router, destination: Destination) -> Destination {
    let pong = handler_fn(|_| async { Ok(HandlerReply::with(b"pong".to_vec())) });
    b.subscribe(pong, destination, SubscribeOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn ping_without_reply() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = handler_fn(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
            Ok(HandlerReply::none())
        }
    });
    b.subscribe(sink, Destination::queue("b.inbox"), SubscribeOptions::default())
        .await
        .unwrap();

    a.send_message(b"ping".to_vec(), &Destination::queue("b.inbox"), SendOptions::default())
        .await
        .unwrap();

    let got = rx.recv().await.unwrap();
    assert_eq!(got.message, b"ping");
    assert_eq!(got.from, "a");
    assert_eq!(got.queue, "b.inbox");
    assert!(got.reply_to.is_empty());
    assert!(got.id.starts_with("a."));
    // plain messages never bootstrap the reply queue
    assert!(a.return_destination().await.is_none());
}

#[tokio::test]
async fn ping_pong() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    serve_pong(&b, Destination::queue("b.inbox")).await;

    let reply = a
        .send_request(b"ping".to_vec(), &Destination::queue("b.inbox"), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.message, b"pong");
    assert_eq!(reply.from, "b");
    assert_eq!(reply.queue, a.listen_destination().queue);
    assert_eq!(a.return_destination().await.unwrap().queue, reply.queue);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_on_schedule() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let silent = handler_fn(|_| async { Ok(HandlerReply::none()) });
    b.subscribe(silent, Destination::queue("b.silent"), SubscribeOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = a
        .send_request(
            b"ping".to_vec(),
            &Destination::queue("b.silent"),
            SendOptions::with_ttl(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), "MQ_ROUTER_SEND_REQUEST_ERROR");
    assert!(matches!(err.root_cause(), MqError::MessageTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1200), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn slow_subscribe_does_not_hold_up_replies() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let delayed = handler_fn(|msg| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(HandlerReply::with(msg.message))
    });
    b.subscribe(delayed, Destination::queue("b.echo"), SubscribeOptions::default())
        .await
        .unwrap();
    a.ensure_self_subscribed().await.unwrap();

    broker.set_subscribe_latency(Duration::from_secs(2));
    let other = {
        let a = a.clone();
        tokio::spawn(async move {
            let sink = handler_fn(|_| async { Ok(HandlerReply::none()) });
            a.subscribe(sink, Destination::queue("a.other"), SubscribeOptions::default())
                .await
        })
    };
    // let the subscribe reach the broker
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reply = a
        .send_request(
            b"ping".to_vec(),
            &Destination::queue("b.echo"),
            SendOptions::with_ttl(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, b"ping");
    assert!(!other.is_finished());

    assert_eq!(other.await.unwrap().unwrap().queue, "a.other");
}

#[tokio::test]
async fn reply_uses_the_request_wire_version() {
    let broker = InMemoryBroker::new();
    // a can only read V2, so a V1 reply would never resolve the request
    let a = Router::builder(RouterConfig::new("a"))
        .connector(Arc::new(broker.clone()))
        .serializer(Arc::new(EnvelopeCodec::with_versions([WireVersion::V2])))
        .build()
        .unwrap();
    let b = router(&broker, "b");
    serve_pong(&b, Destination::queue("b.inbox")).await;

    let options = SendOptions {
        ttl: Some(Duration::from_secs(2)),
        version: Some(WireVersion::V2),
        ..Default::default()
    };
    let reply = a
        .send_request(b"ping".to_vec(), &Destination::queue("b.inbox"), options)
        .await
        .unwrap();
    assert_eq!(reply.message, b"pong");
}

#[tokio::test]
async fn requests_over_topic_exchanges() {
    let broker = InMemoryBroker::new();
    let mut config = RouterConfig::new("a");
    config.topic = "replies.a".into();
    config.exchange = "rpc".into();
    let a = Router::builder(config)
        .connector(Arc::new(broker.clone()))
        .build()
        .unwrap();
    let b = router(&broker, "b");

    let orders = handler_fn(|msg| async move {
        let answer = format!("{}@{}", msg.topic, msg.exchange);
        Ok(HandlerReply::with(answer.into_bytes()))
    });
    let confirmed = b
        .subscribe(orders, Destination::new("", "orders.*", "events"), SubscribeOptions::default())
        .await
        .unwrap();
    assert!(confirmed.queue.starts_with("amq.gen-"));
    assert_eq!(confirmed.topic, "orders.*");

    let reply = a
        .send_request(
            b"new order".to_vec(),
            &Destination::topic("events", "orders.created"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, b"orders.created@events");
    assert_eq!(reply.topic, "replies.a");
    assert_eq!(reply.exchange, "rpc");
}

#[tokio::test]
async fn default_handler_answers_direct_requests() {
    let broker = InMemoryBroker::new();
    let upper = handler_fn(|msg| async move { Ok(HandlerReply::with(msg.message.to_ascii_uppercase())) });
    let a = Router::builder(RouterConfig::new("a"))
        .connector(Arc::new(broker.clone()))
        .default_handler(upper)
        .build()
        .unwrap();
    let b = router(&broker, "b");

    let own = a.ensure_self_subscribed().await.unwrap();
    let reply = b
        .send_request(b"hello".to_vec(), &own, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.message, b"HELLO");
    assert_eq!(reply.from, "a");
}

#[tokio::test]
async fn unsubscribe_removes_the_broker_consumer() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let inbox = serve_pong(&b, Destination::queue("b.inbox")).await;
    assert_eq!(broker.consumer_count("b.inbox").await, 1);

    assert!(b.unsubscribe(&inbox).await.unwrap());
    assert!(!b.unsubscribe(&inbox).await.unwrap());
    assert!(!broker.queue_exists("b.inbox").await);

    a.send_message(b"late".to_vec(), &inbox, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.stats().dropped, 1);
}

#[tokio::test]
async fn broker_rejection_surfaces_as_send_error() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    broker.set_reject_publish(true);

    let err = a
        .send_message(b"x".to_vec(), &Destination::queue("anywhere"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MQ_ROUTER_SEND_MESSAGE_ERROR");
    assert!(matches!(err.cause(), Some(MqError::SendMQMsg { .. })));
    assert_eq!(err.origin(), "a.MQRouter.sendMessage");
}

#[tokio::test]
async fn close_shuts_down_router_and_connector() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    a.ensure_self_subscribed().await.unwrap();

    a.close().await.unwrap();
    let err = a
        .send_request(b"x".to_vec(), &Destination::queue("b.inbox"), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), MqError::Closed { .. }));
    assert!(broker
        .send_message(Publish {
            destination: Destination::queue("q"),
            message: vec![],
            options: PublishOptions {
                ttl: Duration::from_secs(1),
            },
        })
        .await
        .is_err());
}
