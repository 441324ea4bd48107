use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mq_router_core::{
    handler_fn, Connector, Destination, ErrorCollector, ErrorReport, HandlerReply, InMemoryBroker,
    MqError, Publish, PublishOptions, Router, RouterConfig, SendOptions, SubscribeOptions,
};

fn router(broker: &InMemoryBroker, name: &str) -> Router {
    Router::builder(RouterConfig::new(name))
        .connector(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn direct_message_without_default_handler_is_reported() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let mut errors = a.errors();

    let own = a.ensure_self_subscribed().await.unwrap();
    b.send_message(b"hi".to_vec(), &own, SendOptions::default())
        .await
        .unwrap();

    let report = errors.recv().await.unwrap();
    assert_eq!(report.error.code(), "MQ_ROUTER_ROUTING_ERROR");
    assert!(matches!(report.error.root_cause(), MqError::OwnHandlerMissing { .. }));
    assert_eq!(report.queue, own.queue);
    let envelope = report.envelope.unwrap();
    assert_eq!(envelope.payload, b"hi");
    assert_eq!(envelope.from, "b");

    // the router keeps working afterwards
    let echo = handler_fn(|msg| async move { Ok(HandlerReply::with(msg.message)) });
    b.subscribe(echo, Destination::queue("b.echo"), SubscribeOptions::default())
        .await
        .unwrap();
    let reply = a
        .send_request(b"still here".to_vec(), &Destination::queue("b.echo"), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.message, b"still here");
}

#[tokio::test(start_paused = true)]
async fn reply_after_timeout_is_an_unknown_message_id() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let mut errors = a.errors();

    let slow = handler_fn(|msg| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(HandlerReply::with(msg.message))
    });
    b.subscribe(slow, Destination::queue("b.slow"), SubscribeOptions::default())
        .await
        .unwrap();

    let err = a
        .send_request(
            b"ping".to_vec(),
            &Destination::queue("b.slow"),
            SendOptions::with_ttl(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), MqError::MessageTimeout { .. }));

    let report = errors.recv().await.unwrap();
    assert!(matches!(report.error.root_cause(), MqError::UnknownMessageId { .. }));
    assert!(report.envelope.unwrap().is_reply());
}

#[tokio::test]
async fn undecodable_bytes_are_a_consume_error() {
    let broker = InMemoryBroker::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let collector: Arc<dyn ErrorCollector> = {
        let seen = Arc::clone(&seen);
        Arc::new(move |report: &ErrorReport| {
            assert_eq!(report.error.code(), "MQ_ROUTER_CONSUME_ERROR");
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };
    let a = Router::builder(RouterConfig::new("a"))
        .connector(Arc::new(broker.clone()))
        .error_collector(collector)
        .build()
        .unwrap();
    let mut errors = a.errors();
    let own = a.ensure_self_subscribed().await.unwrap();

    broker
        .send_message(Publish {
            destination: own.clone(),
            message: vec![0x7f, 0x00, 0x01],
            options: PublishOptions {
                ttl: Duration::from_secs(1),
            },
        })
        .await
        .unwrap();

    let report = errors.recv().await.unwrap();
    assert!(report.envelope.is_none());
    assert!(matches!(
        report.error.root_cause(),
        MqError::UnknownMessageType { tag: Some(0x7f), .. }
    ));
    // each failure is reported once
    assert!(errors.try_recv().is_err());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_handler_is_reported_and_request_times_out() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let mut b_errors = b.errors();

    let broken = handler_fn(|_| async { Err(MqError::handler("database unavailable")) });
    b.subscribe(broken, Destination::queue("b.broken"), SubscribeOptions::default())
        .await
        .unwrap();

    let err = a
        .send_request(
            b"ping".to_vec(),
            &Destination::queue("b.broken"),
            SendOptions::with_ttl(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), MqError::MessageTimeout { .. }));

    let report = b_errors.recv().await.unwrap();
    assert_eq!(report.error.origin(), "b.MQRouter.routeMessage");
    assert!(matches!(report.error.root_cause(), MqError::Handler { .. }));
    assert_eq!(report.queue, "b.broken");
}

#[tokio::test]
async fn reply_to_unaddressable_sender_is_reported() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let b = router(&broker, "b");
    let mut b_errors = b.errors();

    let answering = handler_fn(|_| async { Ok(HandlerReply::with(b"answer".to_vec())) });
    b.subscribe(answering, Destination::queue("b.inbox"), SubscribeOptions::default())
        .await
        .unwrap();

    // a never self-subscribed, so its message carries no reply destination
    a.send_message(b"hello".to_vec(), &Destination::queue("b.inbox"), SendOptions::default())
        .await
        .unwrap();

    let report = b_errors.recv().await.unwrap();
    assert!(matches!(report.error.root_cause(), MqError::ValidateDestination { .. }));
}
