//! The broker channel seam.
//!
//! `BrokerChannel` is what the topology manager, publisher and consumer talk
//! to. `AmqpChannel` implements it over RabbitMQ and `MemoryChannel` in
//! process. A raw channel is not safe for concurrent publishes or acks, so
//! the pipeline always goes through `SharedChannel`, which serializes those
//! calls and selects confirm mode once.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::Stream;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::broker::envelope::{Delivery, Envelope};
use crate::broker::topology::{BindingSpec, ExchangeSpec, QueueSpec};

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unavailable(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("broker persistence failure: {0}")]
    Persistence(String),
}

impl BrokerError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Failures that mean "no broker to talk to", as opposed to a broker that
    /// answered and refused.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ChannelClosed)
    }
}

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel was not in confirm mode when the message was sent.
    NotRequested,
}

pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, BrokerError>>;

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

#[async_trait]
pub trait BrokerChannel: Send + Sync + fmt::Debug {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;

    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Bound the number of unacknowledged deliveries outstanding on this channel.
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    /// Send `envelope` and return a future resolving to the broker's confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PendingConfirm, BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Stop the broker pushing deliveries to `consumer_tag`. Deliveries
    /// already handed out stay unacknowledged until settled.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Opens channels on a fresh broker connection.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A channel shared by concurrent handler executions.
///
/// Publish sends, acks and rejects take the same gate, so at most one of them
/// is in flight on the underlying channel. Waiting for a publish confirm
/// happens after the gate is released.
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<dyn BrokerChannel>,
    gate: Arc<Mutex<()>>,
    confirms: Arc<OnceCell<()>>,
}

impl SharedChannel {
    pub fn new(inner: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
            confirms: Arc::new(OnceCell::new()),
        }
    }

    pub fn raw(&self) -> &dyn BrokerChannel {
        self.inner.as_ref()
    }

    /// Put the channel in confirm mode the first time it is needed.
    pub async fn ensure_confirms(&self) -> Result<(), BrokerError> {
        self.confirms
            .get_or_try_init(|| async {
                let _gate = self.gate.lock().await;
                self.inner.confirm_select().await
            })
            .await
            .map(|_| ())
    }

    pub fn confirms_selected(&self) -> bool {
        self.confirms.initialized()
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PendingConfirm, BrokerError> {
        self.ensure_confirms().await?;
        let _gate = self.gate.lock().await;
        self.inner.publish(exchange, routing_key, envelope).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let _gate = self.gate.lock().await;
        self.inner.ack(delivery_tag).await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let _gate = self.gate.lock().await;
        self.inner.reject(delivery_tag, requeue).await
    }
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel")
            .field("inner", &self.inner)
            .field("confirms", &self.confirms.initialized())
            .finish()
    }
}

/// The current channel of a process, swapped after a reconnect so publishers
/// follow the consumer onto the new connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle(Arc<RwLock<SharedChannel>>);

impl ChannelHandle {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self(Arc::new(RwLock::new(SharedChannel::new(channel))))
    }

    pub fn current(&self) -> SharedChannel {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, channel: Arc<dyn BrokerChannel>) {
        let mut slot = self
            .0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = SharedChannel::new(channel);
    }
}
