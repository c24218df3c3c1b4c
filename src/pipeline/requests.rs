use opentelemetry::Context;
use opentelemetry::trace::SpanKind;
use tracing::info;
use uuid::Uuid;

use crate::broker::{Publisher, Topic};
use crate::pipeline::messages::ReportJob;
use crate::utils::error::PipelineError;
use crate::utils::propagation::start_span;

/// The report-request boundary. Success means the job is durably queued, not
/// that the report exists.
#[derive(Debug, Clone)]
pub struct ReportRequests {
    publisher: Publisher,
    topic: Topic,
}

impl ReportRequests {
    pub fn new(publisher: Publisher, topic: Topic) -> Self {
        Self { publisher, topic }
    }

    /// Enqueue under the caller's current context. A fresh trace is started
    /// only when a tracer provider is installed globally (see
    /// `propagation::install_tracer_provider`); otherwise the job carries
    /// whatever span context is current, possibly none.
    pub async fn enqueue(&self, user_id: Uuid) -> Result<(), PipelineError> {
        self.enqueue_with_parent(user_id, &Context::current()).await
    }

    pub async fn enqueue_with_parent(
        &self,
        user_id: Uuid,
        parent: &Context,
    ) -> Result<(), PipelineError> {
        let cx = start_span("report.enqueue", SpanKind::Producer, parent);
        self.publisher
            .publish_json(&self.topic, &ReportJob { user_id }, &cx)
            .await?;
        info!(user_id = %user_id, topic = self.topic.name(), "report job enqueued");
        Ok(())
    }
}
