//! The consumption loop shared by the report worker and the notification
//! router.
//!
//! One long-lived loop per process pulls deliveries from a topic's primary
//! queue. Each delivery runs on its own task, at most `prefetch` at a time,
//! and is settled individually: acked when the handler succeeds, rejected
//! without requeue (and so dead-lettered) when it fails or panics. Handler
//! failures never leave the task that ran them.
//!
//! When the delivery stream ends or fails without a shutdown request the loop
//! opens a new channel through the connector (with the startup retry policy),
//! re-provisions the topic and resumes. Deliveries that were unacknowledged
//! on the lost channel are redelivered by the broker. On shutdown the broker
//! consumer is cancelled before in-flight handlers are awaited.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use opentelemetry::Context;
use opentelemetry::trace::SpanKind;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::channel::{BrokerError, ChannelHandle, Connector, SharedChannel};
use crate::broker::connection::{RetryPolicy, connect_with_retry};
use crate::broker::envelope::Delivery;
use crate::broker::topology::{Topic, ensure_topic};
use crate::utils::error::{HandlerError, PipelineError};
use crate::utils::propagation::{TracePropagator, start_span};

pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// The unit of work run for each delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// `cx` carries the trace context extracted from the delivery's headers,
    /// with a consumer span started under it.
    async fn handle(&self, delivery: &Delivery, cx: &Context) -> Result<(), HandlerError>;
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue.
    Reject,
    /// The ack or reject did not reach the broker, which will redeliver.
    Unsettled,
}

impl Disposition {
    pub fn from_outcome(outcome: &Result<(), HandlerError>) -> Self {
        match outcome {
            Ok(()) => Self::Ack,
            Err(_) => Self::Reject,
        }
    }
}

/// Totals for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub acked: u64,
    pub rejected: u64,
    pub unsettled: u64,
    pub reconnects: u32,
}

impl ConsumerReport {
    fn record(&mut self, joined: Result<Disposition, JoinError>) {
        match joined {
            Ok(Disposition::Ack) => self.acked += 1,
            Ok(Disposition::Reject) => self.rejected += 1,
            Ok(Disposition::Unsettled) => self.unsettled += 1,
            Err(e) => error!(error = %e, "delivery task did not complete"),
        }
    }
}

enum SessionEnd {
    Shutdown,
    StreamClosed,
    StreamFailed(BrokerError),
}

pub struct Consumer {
    connector: Arc<dyn Connector>,
    channel: ChannelHandle,
    topic: Topic,
    propagator: Arc<dyn TracePropagator>,
    prefetch: u16,
    retry: RetryPolicy,
    recovery_interval: Duration,
    consumer_tag: String,
    span_name: &'static str,
}

impl Consumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        channel: ChannelHandle,
        topic: Topic,
        propagator: Arc<dyn TracePropagator>,
    ) -> Self {
        let consumer_tag = format!("{}-{}", topic.primary_queue(), uuid::Uuid::new_v4());
        Self {
            connector,
            channel,
            topic,
            propagator,
            prefetch: 1,
            retry: RetryPolicy::default(),
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            consumer_tag,
            span_name: "deliver",
        }
    }

    /// At least 1; the same bound applies to the broker and to handler
    /// concurrency.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pause between losing a channel and reconnecting.
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn span_name(mut self, name: &'static str) -> Self {
        self.span_name = name;
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Consume until `shutdown` is cancelled, then wait for in-flight
    /// handlers, settle their deliveries and close the channel.
    ///
    /// Errors only when the channel cannot be re-established or the broker
    /// refuses to serve the queue.
    pub async fn run<H: DeliveryHandler>(
        &self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<ConsumerReport, PipelineError> {
        let slots = Arc::new(Semaphore::new(usize::from(self.prefetch)));
        let mut in_flight = JoinSet::new();
        let mut report = ConsumerReport::default();

        let result = self
            .consume_until_shutdown(&handler, &slots, &mut in_flight, &mut report, &shutdown)
            .await;

        if let Err(e) = self.channel.current().raw().cancel(&self.consumer_tag).await {
            debug!(consumer_tag = %self.consumer_tag, error = %e, "consumer cancel failed");
        }
        if !in_flight.is_empty() {
            info!(
                queue = self.topic.primary_queue(),
                in_flight = in_flight.len(),
                "waiting for in-flight deliveries"
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            report.record(joined);
        }

        if let Err(e) = self.channel.current().raw().close().await {
            debug!(error = %e, "channel close failed");
        }
        info!(
            queue = self.topic.primary_queue(),
            acked = report.acked,
            rejected = report.rejected,
            unsettled = report.unsettled,
            reconnects = report.reconnects,
            "consumer stopped"
        );
        result.map(|()| report)
    }

    async fn consume_until_shutdown<H: DeliveryHandler>(
        &self,
        handler: &Arc<H>,
        slots: &Arc<Semaphore>,
        in_flight: &mut JoinSet<Disposition>,
        report: &mut ConsumerReport,
        shutdown: &CancellationToken,
    ) -> Result<(), PipelineError> {
        loop {
            let channel = self.channel.current();
            let session = self
                .consume_session(&channel, handler, slots, in_flight, report, shutdown)
                .await;
            match session {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::StreamClosed) => {
                    warn!(queue = self.topic.primary_queue(), "delivery stream closed")
                }
                Ok(SessionEnd::StreamFailed(e)) => {
                    warn!(queue = self.topic.primary_queue(), error = %e, "delivery stream failed")
                }
                Err(e) if e.is_unavailable() => {
                    warn!(queue = self.topic.primary_queue(), error = %e, "channel lost")
                }
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = channel.raw().close().await {
                debug!(error = %e, "closing lost channel failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.recovery_interval) => {}
            }
            let fresh = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = connect_with_retry(self.connector.as_ref(), self.retry) => connected?,
            };
            ensure_topic(fresh.as_ref(), &self.topic).await?;
            self.channel.replace(fresh);
            report.reconnects += 1;
            info!(queue = self.topic.primary_queue(), "channel re-established");
        }
    }

    async fn consume_session<H: DeliveryHandler>(
        &self,
        channel: &SharedChannel,
        handler: &Arc<H>,
        slots: &Arc<Semaphore>,
        in_flight: &mut JoinSet<Disposition>,
        report: &mut ConsumerReport,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, BrokerError> {
        let queue = self.topic.primary_queue();
        channel.raw().basic_qos(self.prefetch).await?;
        let mut deliveries = channel.raw().consume(queue, &self.consumer_tag).await?;
        info!(queue, prefetch = self.prefetch, "consuming");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                report.record(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(SessionEnd::Shutdown),
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let parent = self.propagator.extract(delivery.envelope.headers());
                    let cx = start_span(self.span_name, SpanKind::Consumer, &parent);
                    in_flight.spawn(settle(
                        channel.clone(),
                        handler.clone(),
                        delivery,
                        cx,
                        queue.to_string(),
                        permit,
                    ));
                }
                Some(Err(e)) => return Ok(SessionEnd::StreamFailed(e)),
                None => return Ok(SessionEnd::StreamClosed),
            }
        }
    }
}

/// Run the handler for one delivery and settle it on the channel it came from.
async fn settle<H: DeliveryHandler>(
    channel: SharedChannel,
    handler: Arc<H>,
    delivery: Delivery,
    cx: Context,
    queue: String,
    _permit: OwnedSemaphorePermit,
) -> Disposition {
    let tag = delivery.delivery_tag;
    let outcome = match AssertUnwindSafe(handler.handle(&delivery, &cx))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
    };

    let settled = match &outcome {
        Ok(()) => channel.ack(tag).await,
        Err(e) => {
            warn!(
                queue = %queue,
                delivery_tag = tag,
                redelivered = delivery.redelivered,
                error = %e,
                "handler failed, dead-lettering delivery"
            );
            channel.reject(tag, false).await
        }
    };
    match settled {
        Ok(()) => Disposition::from_outcome(&outcome),
        Err(e) => {
            warn!(
                queue = %queue,
                delivery_tag = tag,
                error = %e,
                "could not settle delivery, broker will redeliver it"
            );
            Disposition::Unsettled
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
