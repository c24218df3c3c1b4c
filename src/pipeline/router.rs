use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::Context;
use tracing::{debug, info};

use crate::broker::{Delivery, DeliveryHandler};
use crate::pipeline::messages::NotificationEvent;
use crate::transport::{PushTransport, ServerMessage};
use crate::utils::error::HandlerError;

/// Delivers completion events to the sessions subscribed under the event's
/// user id.
#[derive(Debug)]
pub struct NotificationRouter<T> {
    transport: Arc<T>,
}

impl<T: PushTransport> NotificationRouter<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: PushTransport> DeliveryHandler for NotificationRouter<T> {
    async fn handle(&self, delivery: &Delivery, _cx: &Context) -> Result<(), HandlerError> {
        let event: NotificationEvent = delivery.envelope.decode_json()?;
        let message = ServerMessage::Notification {
            file_name: event.file_name,
            download_url: event.download_url,
        };

        // Zero subscribers is a successful delivery; the event is dropped.
        let reached = self
            .transport
            .deliver_to_group(&event.user_id.to_string(), &message);
        if reached == 0 {
            debug!(user_id = %event.user_id, "no subscribed session, notification dropped");
        } else {
            info!(user_id = %event.user_id, sessions = reached, "notification delivered");
        }
        Ok(())
    }
}
