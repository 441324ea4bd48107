use std::sync::Arc;
use std::time::Duration;

use mq_router_core::{
    handler_fn, Destination, HandlerReply, InMemoryBroker, Router, RouterConfig, SendOptions,
    SubscribeOptions,
};
use tokio::task::JoinSet;

fn router(broker: &InMemoryBroker, name: &str) -> Router {
    Router::builder(RouterConfig::new(name))
        .connector(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

async fn echo_on(b: &Router, queue: &str) {
    let echo = handler_fn(|msg| async move { Ok(HandlerReply::with(msg.message)) });
    b.subscribe(echo, Destination::queue(queue), SubscribeOptions::default())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_subscribe_once() {
    let broker = InMemoryBroker::new();
    let b = router(&broker, "b");
    echo_on(&b, "b.echo").await;
    let before = broker.stats().subscribes;

    // keep the bootstrap in flight while every request arrives
    broker.set_subscribe_latency(Duration::from_millis(50));
    let a = router(&broker, "a");

    let mut requests = JoinSet::new();
    for i in 0..16u8 {
        let a = a.clone();
        requests.spawn(async move {
            let reply = a
                .send_request(vec![i], &Destination::queue("b.echo"), SendOptions::default())
                .await;
            (i, reply)
        });
    }
    while let Some(joined) = requests.join_next().await {
        let (i, reply) = joined.unwrap();
        assert_eq!(reply.unwrap().message, vec![i]);
    }

    assert_eq!(broker.stats().subscribes - before, 1);
    assert_eq!(broker.consumer_count(&a.listen_destination().queue).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bootstraps_observe_one_return_destination() {
    let broker = InMemoryBroker::new();
    broker.set_subscribe_latency(Duration::from_millis(20));
    let a = router(&broker, "a");

    let mut waiters = JoinSet::new();
    for _ in 0..8 {
        let a = a.clone();
        waiters.spawn(async move { a.ensure_self_subscribed().await });
    }
    let mut seen = Vec::new();
    while let Some(joined) = waiters.join_next().await {
        seen.push(joined.unwrap().unwrap());
    }

    let own = a.return_destination().await.unwrap();
    assert!(seen.iter().all(|d| *d == own));
    assert_eq!(broker.stats().subscribes, 1);
}

#[tokio::test]
async fn failed_bootstrap_fails_every_waiter_then_retries() {
    let broker = InMemoryBroker::new();
    broker.set_subscribe_latency(Duration::from_millis(20));
    broker.set_reject_subscribe(true);
    let a = router(&broker, "a");

    let mut waiters = JoinSet::new();
    for _ in 0..4 {
        let a = a.clone();
        waiters.spawn(async move { a.ensure_self_subscribed().await });
    }
    while let Some(joined) = waiters.join_next().await {
        let err = joined.unwrap().unwrap_err();
        assert_eq!(err.code(), "MQ_ROUTER_SELF_SUBSCRIBE");
    }
    assert!(a.return_destination().await.is_none());

    broker.set_reject_subscribe(false);
    let own = a.ensure_self_subscribed().await.unwrap();
    assert_eq!(own.queue, a.listen_destination().queue);
}

#[tokio::test]
async fn cancelled_caller_does_not_strand_the_bootstrap() {
    let broker = InMemoryBroker::new();
    broker.set_subscribe_latency(Duration::from_millis(50));
    let a = router(&broker, "a");

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.ensure_self_subscribed().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.abort();

    let own = a.ensure_self_subscribed().await.unwrap();
    assert_eq!(own.queue, a.listen_destination().queue);
    assert_eq!(broker.stats().subscribes, 1);
}

#[tokio::test]
async fn unsubscribing_own_queue_rearms_the_bootstrap() {
    let broker = InMemoryBroker::new();
    let a = router(&broker, "a");
    let own = a.ensure_self_subscribed().await.unwrap();

    assert!(a.unsubscribe(&own).await.unwrap());
    assert!(a.return_destination().await.is_none());

    let again = a.ensure_self_subscribed().await.unwrap();
    assert_eq!(again, own);
    assert_eq!(broker.stats().subscribes, 2);
}
