use std::sync::Arc;
use std::time::Duration;

use opentelemetry::Context;
use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::channel::{ChannelHandle, Confirmation};
use crate::broker::envelope::{Envelope, JSON_CONTENT_TYPE};
use crate::broker::topology::Topic;
use crate::utils::error::PipelineError;
use crate::utils::propagation::TracePropagator;

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Confirmed, persistent publishing onto a topic's exchange.
#[derive(Debug, Clone)]
pub struct Publisher {
    channel: ChannelHandle,
    propagator: Arc<dyn TracePropagator>,
    confirm_timeout: Duration,
}

impl Publisher {
    pub fn new(channel: ChannelHandle, propagator: Arc<dyn TracePropagator>) -> Self {
        Self {
            channel,
            propagator,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    /// Publish `envelope` to `topic` and wait for the broker to confirm it.
    ///
    /// The envelope is sent persistent, with a content type, and with the
    /// trace context of `cx` injected into its headers. Returns only once the
    /// broker has acknowledged it; a negative confirm or no answer within the
    /// confirm timeout is `PublishUnconfirmed`.
    pub async fn publish(
        &self,
        topic: &Topic,
        envelope: Envelope,
        cx: &Context,
    ) -> Result<(), PipelineError> {
        let channel = self.channel.current();
        channel.ensure_confirms().await?;

        let mut headers = envelope.headers().clone();
        self.propagator.inject(cx, &mut headers);
        let mut envelope = envelope.persistent().with_headers(headers);
        if envelope.content_type().is_empty() {
            envelope = envelope.with_content_type(JSON_CONTENT_TYPE);
        }

        let exchange = topic.exchange();
        let pending = channel.publish(exchange, "", &envelope).await?;

        let outcome = tokio::time::timeout(self.confirm_timeout, pending).await;
        let reason = match outcome {
            Ok(Ok(Confirmation::Ack)) => {
                debug!(exchange, bytes = envelope.payload().len(), "publish confirmed");
                return Ok(());
            }
            Ok(Ok(Confirmation::Nack)) => "broker returned a negative acknowledgement".to_string(),
            Ok(Ok(Confirmation::NotRequested)) => "channel is not in confirm mode".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no confirmation within {:?}", self.confirm_timeout),
        };
        warn!(exchange, reason = %reason, "publish not confirmed");
        Err(PipelineError::publish_unconfirmed(exchange, reason))
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &Topic,
        value: &T,
        cx: &Context,
    ) -> Result<(), PipelineError> {
        self.publish(topic, Envelope::json(value)?, cx).await
    }
}
