use futures::StreamExt;
use tempfile::TempDir;

use super::{ConfirmMode, MemoryBroker};
use crate::broker::channel::{BrokerChannel, BrokerError, Confirmation};
use crate::broker::envelope::Envelope;
use crate::broker::topology::{
    BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topic, ensure_topic,
};

async fn declare_queue(channel: &dyn BrokerChannel, name: &str) {
    channel.declare_queue(&QueueSpec::durable(name)).await.unwrap();
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "jobs").await;

    channel
        .publish("", "jobs", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(broker.queue_len("jobs"), Some(1));
}

#[tokio::test]
async fn test_fanout_copies_to_every_bound_queue() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    channel
        .declare_exchange(&ExchangeSpec::durable("events", ExchangeKind::Fanout))
        .await
        .unwrap();
    for queue in ["a", "b"] {
        declare_queue(channel.as_ref(), queue).await;
        channel
            .bind_queue(&BindingSpec::new(queue, "events"))
            .await
            .unwrap();
    }

    channel
        .publish("events", "ignored", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap();

    assert_eq!(broker.queue_len("a"), Some(1));
    assert_eq!(broker.queue_len("b"), Some(1));
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();

    let Err(err) = channel
        .publish("nowhere", "", &Envelope::new(b"x".to_vec()))
        .await
    else {
        panic!("publish to a missing exchange succeeded");
    };

    assert!(matches!(err, BrokerError::NotFound { kind: "exchange", .. }));
}

#[tokio::test]
async fn test_bind_requires_both_ends() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;

    let err = channel
        .bind_queue(&BindingSpec::new("q", "missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::NotFound { kind: "exchange", .. }));
}

#[tokio::test]
async fn test_redeclare_with_other_arguments_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    declare_queue(channel.as_ref(), "q").await;

    let err = channel
        .declare_queue(&QueueSpec::durable("q").with_argument("x-dead-letter-exchange", "dlx"))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_confirm_not_requested_without_confirm_mode() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;

    let confirmation = channel
        .publish("", "q", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(confirmation, Confirmation::NotRequested);

    channel.confirm_select().await.unwrap();
    broker.set_confirm_mode(ConfirmMode::Ack);
    let confirmation = channel
        .publish("", "q", &Envelope::new(b"y".to_vec()))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(confirmation, Confirmation::Ack);
}

#[tokio::test]
async fn test_ack_settles_once() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    channel
        .publish("", "q", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap();

    let mut deliveries = channel.consume("q", "test").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(broker.unacked(), 1);

    channel.ack(delivery.delivery_tag).await.unwrap();
    assert_eq!(broker.unacked(), 0);
    assert!(matches!(
        channel.ack(delivery.delivery_tag).await,
        Err(BrokerError::UnknownDeliveryTag(_))
    ));
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    channel
        .publish("", "q", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap();

    let mut deliveries = channel.consume("q", "test").await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    assert!(!first.redelivered);
    channel.reject(first.delivery_tag, true).await.unwrap();

    let second = deliveries.next().await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_ne!(first.delivery_tag, second.delivery_tag);
}

#[tokio::test]
async fn test_reject_without_dead_letter_exchange_drops() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    channel
        .publish("", "q", &Envelope::new(b"x".to_vec()))
        .await
        .unwrap();

    let mut deliveries = channel.consume("q", "test").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    channel.reject(delivery.delivery_tag, false).await.unwrap();

    assert_eq!(broker.queue_len("q"), Some(0));
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn test_prefetch_limits_dispatch() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    for n in 0..4u8 {
        channel
            .publish("", "q", &Envelope::new(vec![n]))
            .await
            .unwrap();
    }
    channel.basic_qos(1).await.unwrap();

    let mut deliveries = channel.consume("q", "test").await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(broker.unacked(), 1);
    assert_eq!(broker.queue_len("q"), Some(3));

    channel.ack(first.delivery_tag).await.unwrap();
    let second = deliveries.next().await.unwrap().unwrap();
    assert_eq!(second.envelope.payload(), &[1]);
}

#[tokio::test]
async fn test_closing_channel_requeues_unacked_in_order() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    for n in 0..3u8 {
        channel
            .publish("", "q", &Envelope::new(vec![n]))
            .await
            .unwrap();
    }

    let mut deliveries = channel.consume("q", "test").await.unwrap();
    for _ in 0..3 {
        deliveries.next().await.unwrap().unwrap();
    }
    channel.close().await.unwrap();

    assert!(!channel.is_open());
    assert!(deliveries.next().await.is_none());
    let payloads: Vec<Vec<u8>> = broker
        .peek("q")
        .iter()
        .map(|e| e.payload().to_vec())
        .collect();
    assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
}

#[tokio::test]
async fn test_unreachable_broker_refuses_channels() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    assert!(matches!(broker.channel(), Err(BrokerError::Unavailable(_))));
}

#[tokio::test]
async fn test_confirmed_persistent_message_survives_restart() {
    let dir = TempDir::new().unwrap();
    let topic = Topic::named("report");
    {
        let broker = MemoryBroker::open(dir.path()).unwrap();
        let channel = broker.channel().unwrap();
        ensure_topic(channel.as_ref(), &topic).await.unwrap();
        channel.confirm_select().await.unwrap();
        let confirmation = channel
            .publish("report", "", &Envelope::new(b"durable".to_vec()).persistent())
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(confirmation, Confirmation::Ack);
        channel
            .publish("report", "", &Envelope::new(b"transient".to_vec()))
            .await
            .unwrap();
        broker.shutdown();
    }

    let broker = MemoryBroker::open(dir.path()).unwrap();
    let channel = broker.channel().unwrap();
    let mut deliveries = channel.consume("report", "after-restart").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();

    assert_eq!(delivery.envelope.payload(), b"durable");
    assert_eq!(broker.queue_len("report"), Some(0));
    assert_eq!(broker.snapshot().queues.len(), 3);
}

#[tokio::test]
async fn test_unacked_persistent_message_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let broker = MemoryBroker::open(dir.path()).unwrap();
        let channel = broker.channel().unwrap();
        declare_queue(channel.as_ref(), "q").await;
        channel
            .publish("", "q", &Envelope::new(b"x".to_vec()).persistent())
            .await
            .unwrap();
        let mut deliveries = channel.consume("q", "test").await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        broker.shutdown();
    }

    let broker = MemoryBroker::open(dir.path()).unwrap();
    assert_eq!(broker.queue_len("q"), Some(1));
}

#[tokio::test]
async fn test_acked_message_is_gone_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let broker = MemoryBroker::open(dir.path()).unwrap();
        let channel = broker.channel().unwrap();
        declare_queue(channel.as_ref(), "q").await;
        channel
            .publish("", "q", &Envelope::new(b"x".to_vec()).persistent())
            .await
            .unwrap();
        let mut deliveries = channel.consume("q", "test").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.ack(delivery.delivery_tag).await.unwrap();
        broker.shutdown();
    }

    let broker = MemoryBroker::open(dir.path()).unwrap();
    assert_eq!(broker.queue_len("q"), Some(0));
}

#[tokio::test]
async fn test_cancel_stops_dispatch_to_consumer() {
    let broker = MemoryBroker::new();
    let channel = broker.channel().unwrap();
    declare_queue(channel.as_ref(), "q").await;
    channel.basic_qos(1).await.unwrap();
    for n in 0..3u8 {
        channel
            .publish("", "q", &Envelope::new(vec![n]))
            .await
            .unwrap();
    }

    let mut deliveries = channel.consume("q", "worker").await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    channel.cancel("worker").await.unwrap();
    channel.ack(first.delivery_tag).await.unwrap();

    assert!(deliveries.next().await.is_none());
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.queue_len("q"), Some(2));
    assert!(matches!(
        channel.cancel("worker").await,
        Err(BrokerError::NotFound { kind: "consumer", .. })
    ));
}

#[tokio::test]
async fn test_closed_channels_are_pruned_on_open() {
    let broker = MemoryBroker::new();
    for _ in 0..5 {
        let channel = broker.channel().unwrap();
        channel.close().await.unwrap();
    }
    let _open = broker.channel().unwrap();

    assert_eq!(broker.tracked_channels(), 1);
}

#[tokio::test]
async fn test_failed_dead_letter_keeps_the_message() {
    let dir = TempDir::new().unwrap();
    {
        let broker = MemoryBroker::open(dir.path()).unwrap();
        let channel = broker.channel().unwrap();
        channel
            .declare_queue(&QueueSpec::durable("q").with_argument("x-dead-letter-exchange", "gone"))
            .await
            .unwrap();
        channel
            .publish("", "q", &Envelope::new(b"x".to_vec()).persistent())
            .await
            .unwrap();

        let mut deliveries = channel.consume("q", "test").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        let err = channel.reject(delivery.delivery_tag, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { kind: "exchange", .. }));

        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.envelope.payload(), b"x");
        broker.shutdown();
    }

    let broker = MemoryBroker::open(dir.path()).unwrap();
    assert_eq!(broker.queue_len("q"), Some(1));
}
