//! Process roles: what each binary subcommand runs, wired from `Settings`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::broker::{
    ChannelHandle, Connector, Consumer, ConsumerReport, Publisher, Topic, connect_with_retry,
    ensure_topic,
};
use crate::config::Settings;
use crate::pipeline::replay::{ReplayOptions, ReplaySummary, replay_dead_letters};
use crate::pipeline::requests::ReportRequests;
use crate::pipeline::router::NotificationRouter;
use crate::pipeline::worker::ReportWorker;
use crate::report::ReportProducer;
use crate::transport::PushTransport;
use crate::utils::error::PipelineError;
use crate::utils::propagation::{TracePropagator, W3cPropagator};

#[derive(Debug, Clone)]
pub struct Runtime {
    settings: Settings,
    connector: Arc<dyn Connector>,
    propagator: Arc<dyn TracePropagator>,
}

impl Runtime {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            propagator: Arc::new(W3cPropagator::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn report_topic(&self) -> Topic {
        self.settings.topics.report_topic()
    }

    pub fn notification_topic(&self) -> Topic {
        self.settings.topics.notification_topic()
    }

    /// Connect with the startup retry policy; exhaustion is fatal.
    pub async fn connect(&self) -> Result<ChannelHandle, PipelineError> {
        let channel =
            connect_with_retry(self.connector.as_ref(), self.settings.broker.retry_policy())
                .await?;
        Ok(ChannelHandle::new(channel))
    }

    /// Connect and provision `topics`.
    pub async fn connect_provisioned(&self, topics: &[Topic]) -> Result<ChannelHandle, PipelineError> {
        let channel = self.connect().await?;
        for topic in topics {
            ensure_topic(channel.current().raw(), topic).await?;
        }
        Ok(channel)
    }

    /// Provision both topics and disconnect.
    pub async fn provision(&self) -> Result<(), PipelineError> {
        let channel = self
            .connect_provisioned(&[self.report_topic(), self.notification_topic()])
            .await?;
        channel.current().raw().close().await?;
        Ok(())
    }

    pub fn publisher(&self, channel: &ChannelHandle) -> Publisher {
        Publisher::new(channel.clone(), self.propagator.clone())
            .with_confirm_timeout(self.settings.broker.confirm_timeout())
    }

    fn consumer(&self, channel: &ChannelHandle, topic: Topic, span_name: &'static str) -> Consumer {
        Consumer::new(
            self.connector.clone(),
            channel.clone(),
            topic,
            self.propagator.clone(),
        )
        .prefetch(self.settings.broker.prefetch)
        .retry(self.settings.broker.retry_policy())
        .recovery_interval(self.settings.broker.recovery_interval())
        .span_name(span_name)
    }

    /// Report-request boundary: publish one job and disconnect.
    pub async fn enqueue(&self, user_id: Uuid) -> Result<(), PipelineError> {
        let topic = self.report_topic();
        let channel = self.connect_provisioned(std::slice::from_ref(&topic)).await?;
        let requests = ReportRequests::new(self.publisher(&channel), topic);
        let result = requests.enqueue(user_id).await;
        channel.current().raw().close().await?;
        result
    }

    /// Consume report jobs until `shutdown`. Completion events go out on the
    /// same channel.
    pub async fn run_report_worker(
        &self,
        producer: ReportProducer,
        shutdown: CancellationToken,
    ) -> Result<ConsumerReport, PipelineError> {
        let report = self.report_topic();
        let notification = self.notification_topic();
        let channel = self
            .connect_provisioned(&[report.clone(), notification.clone()])
            .await?;

        let worker = ReportWorker::new(producer, self.publisher(&channel), notification);
        info!(topic = report.name(), prefetch = self.settings.broker.prefetch, "report worker started");
        self.consumer(&channel, report, "report.process")
            .run(Arc::new(worker), shutdown)
            .await
    }

    pub async fn run_notification_router<T: PushTransport>(
        &self,
        transport: Arc<T>,
        shutdown: CancellationToken,
    ) -> Result<ConsumerReport, PipelineError> {
        let notification = self.notification_topic();
        let channel = self
            .connect_provisioned(std::slice::from_ref(&notification))
            .await?;

        info!(topic = notification.name(), "notification router started");
        self.consumer(&channel, notification, "notification.route")
            .run(Arc::new(NotificationRouter::new(transport)), shutdown)
            .await
    }

    pub async fn replay(&self, topic: Topic, options: ReplayOptions) -> Result<ReplaySummary, PipelineError> {
        let channel = self.connect_provisioned(std::slice::from_ref(&topic)).await?;
        let publisher = self.publisher(&channel);
        let result =
            replay_dead_letters(&channel, &publisher, &self.propagator, &topic, options).await;
        channel.current().raw().close().await?;
        result
    }
}
