use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::{ConfirmMode, Shared, lock};
use crate::broker::channel::{
    BrokerChannel, BrokerError, Confirmation, DeliveryStream, PendingConfirm,
};
use crate::broker::envelope::{Delivery, Envelope};
use crate::broker::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::persistence::StoredEnvelope;

const DISPATCH_POLL: Duration = Duration::from_millis(10);

pub(super) struct ChannelCore {
    confirm: AtomicBool,
    prefetch: AtomicUsize,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, StoredEnvelope)>>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
    capacity: Notify,
    closed: CancellationToken,
}

impl ChannelCore {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            confirm: AtomicBool::new(false),
            prefetch: AtomicUsize::new(0),
            next_tag: AtomicU64::new(0),
            unacked: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            capacity: Notify::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Returns false if the channel was already closed.
    pub(super) fn mark_closed(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        self.capacity.notify_waiters();
        true
    }

    /// Take every unsettled delivery, oldest first.
    pub(super) fn drain_unacked(&self) -> Vec<(String, StoredEnvelope)> {
        let mut drained: Vec<(u64, (String, StoredEnvelope))> =
            lock(&self.unacked).drain().collect();
        drained.sort_by_key(|(tag, _)| *tag);
        drained.into_iter().map(|(_, entry)| entry).collect()
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(super) fn unacked_len(&self) -> usize {
        lock(&self.unacked).len()
    }

    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        prefetch == 0 || self.unacked_len() < prefetch
    }

    fn take(&self, delivery_tag: u64) -> Result<(String, StoredEnvelope), BrokerError> {
        let entry = lock(&self.unacked)
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        self.capacity.notify_waiters();
        Ok(entry)
    }
}

/// A channel on a `MemoryBroker`.
pub struct MemoryChannel {
    broker: Arc<Shared>,
    core: Arc<ChannelCore>,
}

impl MemoryChannel {
    pub(super) fn new(broker: Arc<Shared>, core: Arc<ChannelCore>) -> Self {
        Self { broker, core }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.core.closed.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("open", &!self.core.closed.is_cancelled())
            .field("prefetch", &self.core.prefetch.load(Ordering::SeqCst))
            .field("unacked", &self.core.unacked_len())
            .finish()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.close_channel(&self.core);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_queue(spec)
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.bind_queue(binding)
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core.prefetch.store(prefetch as usize, Ordering::SeqCst);
        self.core.capacity.notify_waiters();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PendingConfirm, BrokerError> {
        self.ensure_open()?;
        let persisted = self.broker.publish(exchange, routing_key, envelope)?;

        if !self.core.confirm.load(Ordering::SeqCst) {
            return Ok(Box::pin(future::ready(Ok(Confirmation::NotRequested))));
        }

        let confirmation = match self.broker.confirm_mode() {
            ConfirmMode::Withhold => return Ok(Box::pin(future::pending())),
            ConfirmMode::Nack => Confirmation::Nack,
            ConfirmMode::Ack if persisted && self.broker.flush().is_err() => Confirmation::Nack,
            ConfirmMode::Ack => Confirmation::Ack,
        };
        Ok(Box::pin(future::ready(Ok(confirmation))))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        if !lock(&self.broker.state).queues.contains_key(queue) {
            return Err(BrokerError::not_found("queue", queue));
        }

        let cancelled = self.core.closed.child_token();
        let previous = lock(&self.core.consumers)
            .insert(consumer_tag.to_string(), cancelled.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(
            self.broker.clone(),
            self.core.clone(),
            queue.to_string(),
            cancelled,
            tx,
        ));

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let token = lock(&self.core.consumers)
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::not_found("consumer", consumer_tag))?;
        // Taking the state lock orders the cancel after any dispatch in progress.
        let _state = lock(&self.broker.state);
        token.cancel();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let (queue, message) = self.core.take(delivery_tag)?;
        self.broker.forget(&queue, &message)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let (queue, message) = self.core.take(delivery_tag)?;
        if requeue {
            self.broker.requeue(vec![(queue, message)]);
            return Ok(());
        }
        if let Err(e) = self.broker.dead_letter(&queue, &message) {
            self.broker.requeue(vec![(queue, message)]);
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close_channel(&self.core);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.core.closed.is_cancelled()
    }
}

/// Feed `queue` to one consumer while the channel has prefetch capacity.
/// Ends, closing the stream, when the channel closes, the consumer is
/// cancelled or the receiving side goes away. `cancelled` is a child of the
/// channel's close token.
async fn dispatch(
    broker: Arc<Shared>,
    core: Arc<ChannelCore>,
    queue: String,
    cancelled: CancellationToken,
    tx: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
) {
    loop {
        if cancelled.is_cancelled() {
            break;
        }

        if !core.has_capacity() {
            tokio::select! {
                _ = core.capacity.notified() => {}
                _ = tokio::time::sleep(DISPATCH_POLL) => {}
                _ = cancelled.cancelled() => break,
            }
            continue;
        }

        let (next, notify) = {
            let mut state = lock(&broker.state);
            if cancelled.is_cancelled() {
                break;
            }
            let Some(target) = state.queues.get_mut(&queue) else {
                let _ = tx.send(Err(BrokerError::not_found("queue", &queue)));
                break;
            };
            let next = target.ready.pop_front().map(|message| {
                let tag = core.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let delivery = Delivery {
                    delivery_tag: tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    envelope: message.envelope.clone(),
                };
                lock(&core.unacked).insert(tag, (queue.clone(), message));
                delivery
            });
            (next, target.notify.clone())
        };

        match next {
            Some(delivery) => {
                let tag = delivery.delivery_tag;
                if tx.send(Ok(delivery)).is_err() {
                    if let Ok(entry) = core.take(tag) {
                        broker.requeue(vec![entry]);
                    }
                    break;
                }
            }
            None => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL) => {}
                    _ = cancelled.cancelled() => break,
                }
            }
        }
    }
}
