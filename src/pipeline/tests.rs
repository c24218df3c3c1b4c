use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use opentelemetry::Context;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::{NotificationEvent, ReportJob};
use super::replay::{ReplayOptions, replay_dead_letters};
use super::requests::ReportRequests;
use super::router::NotificationRouter;
use super::worker::ReportWorker;
use crate::broker::memory::{FIRST_DEATH_QUEUE, MemoryBroker};
use crate::broker::{
    BrokerChannel, ChannelHandle, Delivery, DeliveryHandler, Envelope, Publisher, Topic,
    ensure_topic,
};
use crate::report::ReportProducer;
use crate::session::Session;
use crate::storage::MemoryObjectStore;
use crate::transport::{HubHandle, PushTransport, ServerMessage};
use crate::utils::error::HandlerError;
use crate::utils::propagation::{TracePropagator, W3cPropagator, install_tracer_provider};

const TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";

fn propagator() -> Arc<dyn TracePropagator> {
    Arc::new(W3cPropagator::new())
}

fn traced_context() -> Context {
    Context::new().with_remote_span_context(SpanContext::new(
        TraceId::from_hex(TRACE_ID).unwrap(),
        SpanId::from_hex("b7ad6b7169203331").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

fn delivery(envelope: Envelope) -> Delivery {
    Delivery {
        delivery_tag: 1,
        redelivered: false,
        exchange: "notification".to_string(),
        routing_key: String::new(),
        envelope,
    }
}

fn event(user_id: Uuid) -> NotificationEvent {
    NotificationEvent {
        user_id,
        file_name: format!("{user_id}-1.csv"),
        download_url: "memory://files/report.csv".to_string(),
    }
}

async fn provisioned(broker: &MemoryBroker, topics: &[&Topic]) -> ChannelHandle {
    let channel = broker.channel().unwrap();
    for topic in topics {
        ensure_topic(channel.as_ref(), topic).await.unwrap();
    }
    ChannelHandle::new(channel)
}

#[test]
fn test_message_schemas_are_camel_case() {
    let user_id = Uuid::parse_str("3f2b8f5e-8a4c-4d8e-9a53-2c1d7f3a9b10").unwrap();

    assert_eq!(
        serde_json::to_value(ReportJob { user_id }).unwrap(),
        serde_json::json!({"userId": "3f2b8f5e-8a4c-4d8e-9a53-2c1d7f3a9b10"})
    );
    let value = serde_json::to_value(event(user_id)).unwrap();
    assert!(value.get("fileName").is_some());
    assert!(value.get("downloadUrl").is_some());
}

#[tokio::test]
async fn test_router_delivers_to_subscribed_session() {
    let hub = Arc::new(HubHandle::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = Session::new(tx);
    hub.register_session(session.clone());
    let user_id = Uuid::new_v4();
    hub.announce_identity(&session.id, &user_id.to_string()).unwrap();
    let router = NotificationRouter::new(hub.clone());

    let envelope = Envelope::json(&event(user_id)).unwrap();
    router
        .handle(&delivery(envelope), &Context::new())
        .await
        .unwrap();

    let frame = rx.try_recv().unwrap();
    let message: ServerMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(
        message,
        ServerMessage::Notification {
            file_name: format!("{user_id}-1.csv"),
            download_url: "memory://files/report.csv".to_string(),
        }
    );
}

#[tokio::test]
async fn test_router_without_subscribers_succeeds() {
    let router = NotificationRouter::new(Arc::new(HubHandle::new()));
    let envelope = Envelope::json(&event(Uuid::new_v4())).unwrap();

    let outcome = router.handle(&delivery(envelope), &Context::new()).await;

    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_router_rejects_malformed_event() {
    let router = NotificationRouter::new(Arc::new(HubHandle::new()));

    let outcome = router
        .handle(&delivery(Envelope::new(b"{\"userId\": 7}".to_vec())), &Context::new())
        .await;

    assert!(matches!(outcome, Err(HandlerError::Decode(_))));
}

#[tokio::test]
async fn test_enqueue_publishes_traced_persistent_job() {
    let broker = MemoryBroker::new();
    let topic = Topic::named("report");
    let channel = provisioned(&broker, &[&topic]).await;
    let requests = ReportRequests::new(Publisher::new(channel, propagator()), topic);
    let user_id = Uuid::new_v4();

    install_tracer_provider();
    requests.enqueue(user_id).await.unwrap();

    let queued = broker.peek("report");
    assert_eq!(queued.len(), 1);
    assert!(queued[0].is_persistent());
    assert_eq!(queued[0].content_type(), "application/json");
    assert!(queued[0].header("traceparent").is_some());
    let job: ReportJob = queued[0].decode_json().unwrap();
    assert_eq!(job.user_id, user_id);
}

#[tokio::test]
async fn test_enqueue_continues_callers_trace() {
    let broker = MemoryBroker::new();
    let topic = Topic::named("report");
    let channel = provisioned(&broker, &[&topic]).await;
    let requests = ReportRequests::new(Publisher::new(channel, propagator()), topic);

    requests
        .enqueue_with_parent(Uuid::new_v4(), &traced_context())
        .await
        .unwrap();

    let queued = broker.peek("report");
    let cx = propagator().extract(queued[0].headers());
    assert_eq!(
        cx.span().span_context().trace_id(),
        TraceId::from_hex(TRACE_ID).unwrap()
    );
}

#[tokio::test]
async fn test_worker_uploads_and_publishes_notification() {
    let broker = MemoryBroker::new();
    let report = Topic::named("report");
    let notification = Topic::named("notification");
    let channel = provisioned(&broker, &[&report, &notification]).await;
    let store = Arc::new(MemoryObjectStore::new());
    let worker = ReportWorker::new(
        ReportProducer::new(store.clone(), "files"),
        Publisher::new(channel, propagator()),
        notification,
    );
    let user_id = Uuid::new_v4();

    worker
        .handle(
            &delivery(Envelope::json(&ReportJob { user_id }).unwrap()),
            &traced_context(),
        )
        .await
        .unwrap();

    let queued = broker.peek("notification");
    assert_eq!(queued.len(), 1);
    let event: NotificationEvent = queued[0].decode_json().unwrap();
    assert_eq!(event.user_id, user_id);
    assert_eq!(store.keys("files"), vec![event.file_name.clone()]);
    let carried = propagator().extract(queued[0].headers());
    assert_eq!(
        carried.span().span_context().trace_id(),
        TraceId::from_hex(TRACE_ID).unwrap()
    );
}

#[tokio::test]
async fn test_worker_storage_failure_publishes_nothing() {
    let broker = MemoryBroker::new();
    let report = Topic::named("report");
    let notification = Topic::named("notification");
    let channel = provisioned(&broker, &[&report, &notification]).await;
    let store = Arc::new(MemoryObjectStore::new());
    store.set_failing(true);
    let worker = ReportWorker::new(
        ReportProducer::new(store, "files"),
        Publisher::new(channel, propagator()),
        notification,
    );

    let err = worker
        .handle(
            &delivery(Envelope::json(&ReportJob { user_id: Uuid::new_v4() }).unwrap()),
            &Context::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_storage_failure());
    assert_eq!(broker.queue_len("notification"), Some(0));
}

/// Consume `count` messages from the primary queue and reject them so they
/// land in the dead-letter queue.
async fn dead_letter(broker: &MemoryBroker, topic: &Topic, count: usize) {
    let channel = broker.channel().unwrap();
    let mut deliveries = channel.consume(topic.primary_queue(), "rejector").await.unwrap();
    for _ in 0..count {
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();
    }
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_replay_moves_dead_letters_back_to_the_topic() {
    let broker = MemoryBroker::new();
    let topic = Topic::named("report");
    let channel = provisioned(&broker, &[&topic]).await;
    let publisher = Publisher::new(channel.clone(), propagator());
    publisher
        .publish_json(&topic, &ReportJob { user_id: Uuid::new_v4() }, &traced_context())
        .await
        .unwrap();
    dead_letter(&broker, &topic, 1).await;
    assert_eq!(broker.queue_len("report_deadletter"), Some(1));

    let summary = replay_dead_letters(
        &channel,
        &publisher,
        &propagator(),
        &topic,
        ReplayOptions {
            limit: None,
            idle: Duration::from_millis(100),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.replayed, 1);
    assert_eq!(broker.queue_len("report_deadletter"), Some(0));
    let replayed = broker.peek("report");
    assert_eq!(replayed.len(), 1);
    assert!(replayed[0].header(FIRST_DEATH_QUEUE).is_none());
    let carried = propagator().extract(replayed[0].headers());
    assert_eq!(
        carried.span().span_context().trace_id(),
        TraceId::from_hex(TRACE_ID).unwrap()
    );
}

#[tokio::test]
async fn test_replay_stops_at_limit() {
    let broker = MemoryBroker::new();
    let topic = Topic::named("report");
    let channel = provisioned(&broker, &[&topic]).await;
    let publisher = Publisher::new(channel.clone(), propagator());
    for _ in 0..3 {
        publisher
            .publish_json(&topic, &ReportJob { user_id: Uuid::new_v4() }, &Context::new())
            .await
            .unwrap();
    }
    dead_letter(&broker, &topic, 3).await;

    let summary = replay_dead_letters(
        &channel,
        &publisher,
        &propagator(),
        &topic,
        ReplayOptions {
            limit: Some(2),
            idle: Duration::from_millis(100),
        },
    )
    .await
    .unwrap();
    channel.current().raw().close().await.unwrap();

    assert_eq!(summary.replayed, 2);
    assert_eq!(broker.queue_len("report"), Some(2));
    assert_eq!(broker.queue_len("report_deadletter"), Some(1));
}

#[tokio::test]
async fn test_replay_of_empty_queue_returns_after_idle() {
    let broker = MemoryBroker::new();
    let topic = Topic::named("report");
    let channel = provisioned(&broker, &[&topic]).await;
    let publisher = Publisher::new(channel.clone(), propagator());

    let summary = replay_dead_letters(
        &channel,
        &publisher,
        &propagator(),
        &topic,
        ReplayOptions {
            limit: None,
            idle: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.replayed, 0);
}
