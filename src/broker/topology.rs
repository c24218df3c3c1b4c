//! Topic provisioning.
//!
//! A topic owns three exchange/queue pairs:
//!
//! - `<exchange>_unrouted` / `<queue>_unrouted`: fanout catch-all for messages
//!   the primary exchange could not route.
//! - `<exchange>_deadletter` / `<queue>_deadletter`: fanout catch-all for
//!   deliveries rejected without requeue (or expired).
//! - `<exchange>` / `<queue>`: the direct pair the pipeline publishes to, with
//!   `alternate-exchange` pointing at the unrouted exchange and
//!   `x-dead-letter-exchange` at the dead-letter exchange.
//!
//! All declarations are durable with empty binding keys, so provisioning the
//! same topic twice is structurally identical and therefore a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::broker::channel::{BrokerChannel, BrokerError};
use crate::utils::error::PipelineError;

pub const ALTERNATE_EXCHANGE: &str = "alternate-exchange";
pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

const UNROUTED_SUFFIX: &str = "_unrouted";
const DEAD_LETTER_SUFFIX: &str = "_deadletter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub arguments: BTreeMap<String, String>,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<String>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    pub fn alternate_exchange(&self) -> Option<&str> {
        self.arguments.get(ALTERNATE_EXCHANGE).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: BTreeMap<String, String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<String>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments.get(DEAD_LETTER_EXCHANGE).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
        }
    }
}

/// One step of a provisioning plan, applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
}

/// A logical unit of work type and the broker names backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
    exchange: String,
    queue: String,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }

    /// A topic whose exchange and queue share its name.
    pub fn named(name: &str) -> Self {
        Self::new(name, name, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn primary_queue(&self) -> &str {
        &self.queue
    }

    pub fn unrouted_exchange(&self) -> String {
        format!("{}{UNROUTED_SUFFIX}", self.exchange)
    }

    pub fn unrouted_queue(&self) -> String {
        format!("{}{UNROUTED_SUFFIX}", self.queue)
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}{DEAD_LETTER_SUFFIX}", self.exchange)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}{DEAD_LETTER_SUFFIX}", self.queue)
    }

    /// The full provisioning plan. Side paths come first so the primary
    /// exchange and queue never reference a missing exchange.
    pub fn declarations(&self) -> Vec<Declaration> {
        let unrouted_exchange = self.unrouted_exchange();
        let unrouted_queue = self.unrouted_queue();
        let dead_letter_exchange = self.dead_letter_exchange();
        let dead_letter_queue = self.dead_letter_queue();

        vec![
            Declaration::Exchange(ExchangeSpec::durable(
                &unrouted_exchange,
                ExchangeKind::Fanout,
            )),
            Declaration::Queue(QueueSpec::durable(&unrouted_queue)),
            Declaration::Binding(BindingSpec::new(&unrouted_queue, &unrouted_exchange)),
            Declaration::Exchange(ExchangeSpec::durable(
                &dead_letter_exchange,
                ExchangeKind::Fanout,
            )),
            Declaration::Queue(QueueSpec::durable(&dead_letter_queue)),
            Declaration::Binding(BindingSpec::new(&dead_letter_queue, &dead_letter_exchange)),
            Declaration::Exchange(
                ExchangeSpec::durable(&self.exchange, ExchangeKind::Direct)
                    .with_argument(ALTERNATE_EXCHANGE, &unrouted_exchange),
            ),
            Declaration::Queue(
                QueueSpec::durable(&self.queue)
                    .with_argument(DEAD_LETTER_EXCHANGE, &dead_letter_exchange),
            ),
            Declaration::Binding(BindingSpec::new(&self.queue, &self.exchange)),
        ]
    }
}

/// Idempotently declare every exchange, queue and binding of `topic`.
///
/// An unreachable broker surfaces as `BrokerUnavailable`; anything else the
/// broker refuses (for example a conflicting earlier declaration) surfaces as
/// `Topology`. Callers should treat both as fatal at startup.
pub async fn ensure_topic(channel: &dyn BrokerChannel, topic: &Topic) -> Result<(), PipelineError> {
    for declaration in topic.declarations() {
        let result = match &declaration {
            Declaration::Exchange(spec) => channel.declare_exchange(spec).await,
            Declaration::Queue(spec) => channel.declare_queue(spec).await,
            Declaration::Binding(spec) => channel.bind_queue(spec).await,
        };
        result.map_err(|e| provisioning_error(topic, e))?;
    }

    tracing::info!(
        topic = topic.name(),
        exchange = topic.exchange(),
        queue = topic.primary_queue(),
        "topic provisioned"
    );
    Ok(())
}

fn provisioning_error(topic: &Topic, error: BrokerError) -> PipelineError {
    if error.is_unavailable() {
        PipelineError::BrokerUnavailable {
            attempts: 1,
            source: error,
        }
    } else {
        PipelineError::topology(topic.name(), error)
    }
}
