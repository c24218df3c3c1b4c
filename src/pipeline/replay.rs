//! Operator-driven replay of a topic's dead-letter queue back onto the topic.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::broker::{ChannelHandle, Publisher, Topic};
use crate::utils::error::PipelineError;
use crate::utils::propagation::TracePropagator;

const FIRST_DEATH_PREFIX: &str = "x-first-death-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Stop after this many messages.
    pub limit: Option<u64>,
    /// Stop once no dead letter arrives for this long.
    pub idle: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            limit: None,
            idle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: u64,
}

/// Move dead letters of `topic` back to its exchange, one at a time.
///
/// Each message is republished with confirms before its dead-letter copy is
/// acked, so a failure leaves it in the dead-letter queue. Trace headers are
/// kept; the dead-letter bookkeeping headers are dropped.
pub async fn replay_dead_letters(
    channel: &ChannelHandle,
    publisher: &Publisher,
    propagator: &Arc<dyn TracePropagator>,
    topic: &Topic,
    options: ReplayOptions,
) -> Result<ReplaySummary, PipelineError> {
    let queue = topic.dead_letter_queue();
    let shared = channel.current();
    shared.raw().basic_qos(1).await?;
    let tag = format!("{queue}-replay-{}", uuid::Uuid::new_v4());
    let mut deliveries = shared.raw().consume(&queue, &tag).await?;
    info!(queue = %queue, limit = ?options.limit, "replaying dead letters");

    let mut summary = ReplaySummary::default();
    while options.limit.is_none_or(|limit| summary.replayed < limit) {
        let delivery = match tokio::time::timeout(options.idle, deliveries.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(delivery)) => delivery?,
        };

        let envelope = delivery
            .envelope
            .without_headers(|key| key.starts_with(FIRST_DEATH_PREFIX));
        let cx = propagator.extract(envelope.headers());
        if let Err(e) = publisher.publish(topic, envelope, &cx).await {
            warn!(queue = %queue, delivery_tag = delivery.delivery_tag, error = %e, "replay publish failed");
            shared.reject(delivery.delivery_tag, true).await?;
            return Err(e);
        }
        shared.ack(delivery.delivery_tag).await?;
        summary.replayed += 1;
    }
    if let Err(e) = shared.raw().cancel(&tag).await {
        debug!(queue = %queue, error = %e, "replay consumer cancel failed");
    }

    info!(queue = %queue, replayed = summary.replayed, "replay finished");
    Ok(summary)
}
