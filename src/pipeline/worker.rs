use async_trait::async_trait;
use opentelemetry::Context;
use tracing::info;

use crate::broker::{Delivery, DeliveryHandler, Publisher, Topic};
use crate::pipeline::messages::{NotificationEvent, ReportJob};
use crate::report::ReportProducer;
use crate::utils::error::HandlerError;

/// Handles report jobs: build and upload the report, then publish the
/// completion event. Any failure dead-letters the job.
#[derive(Debug, Clone)]
pub struct ReportWorker {
    producer: ReportProducer,
    publisher: Publisher,
    notifications: Topic,
}

impl ReportWorker {
    pub fn new(producer: ReportProducer, publisher: Publisher, notifications: Topic) -> Self {
        Self {
            producer,
            publisher,
            notifications,
        }
    }
}

#[async_trait]
impl DeliveryHandler for ReportWorker {
    async fn handle(&self, delivery: &Delivery, cx: &Context) -> Result<(), HandlerError> {
        let job: ReportJob = delivery.envelope.decode_json()?;
        info!(
            user_id = %job.user_id,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "building report"
        );

        let event: NotificationEvent = self.producer.produce(&job).await?;
        self.publisher
            .publish_json(&self.notifications, &event, cx)
            .await?;
        Ok(())
    }
}
