//! Error types for the report pipeline.
//!
//! `PipelineError` covers failures that are fatal to the enclosing operation
//! (startup, provisioning, publishing). `HandlerError` covers failures inside a
//! single delivery's handler; the consumer turns those into a dead-letter
//! rejection and never lets them escape the consumption loop.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("broker unavailable after {attempts} attempt(s): {source}")]
    BrokerUnavailable {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("failed to provision topic '{topic}': {source}")]
    Topology {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("publish to exchange '{exchange}' was not confirmed: {reason}")]
    PublishUnconfirmed { exchange: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn publish_unconfirmed(exchange: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishUnconfirmed {
            exchange: exchange.into(),
            reason: reason.into(),
        }
    }

    pub fn topology(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::Topology {
            topic: topic.into(),
            source,
        }
    }

    /// True for the failures the startup path treats as "broker not reachable".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable { .. })
            || matches!(self, Self::Broker(e) if e.is_unavailable())
    }
}

/// Failure of a single delivery's unit of work.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("downstream failure: {0}")]
    Downstream(#[from] PipelineError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
