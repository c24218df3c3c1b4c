use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use crate::broker::envelope::Envelope;
use crate::broker::topology::{BindingSpec, ExchangeSpec, QueueSpec};

const EXCHANGES_TREE: &str = "topology/exchanges";
const QUEUES_TREE: &str = "topology/queues";
const BINDINGS_TREE: &str = "topology/bindings";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A message as held by a queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredEnvelope {
    pub id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
}

#[derive(Clone)]
pub struct MessageStore {
    db: Db,
}

impl MessageStore {
    /// Open or create a store under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn save_exchange(&self, spec: &ExchangeSpec) -> Result<(), StoreError> {
        put_json(&self.db.open_tree(EXCHANGES_TREE)?, spec.name.as_bytes(), spec)
    }

    pub fn save_queue(&self, spec: &QueueSpec) -> Result<(), StoreError> {
        put_json(&self.db.open_tree(QUEUES_TREE)?, spec.name.as_bytes(), spec)
    }

    pub fn save_binding(&self, binding: &BindingSpec) -> Result<(), StoreError> {
        let key = format!(
            "{}\u{0}{}\u{0}{}",
            binding.exchange, binding.queue, binding.routing_key
        );
        put_json(&self.db.open_tree(BINDINGS_TREE)?, key.as_bytes(), binding)
    }

    pub fn exchanges(&self) -> Result<Vec<ExchangeSpec>, StoreError> {
        read_all(&self.db.open_tree(EXCHANGES_TREE)?)
    }

    pub fn queues(&self) -> Result<Vec<QueueSpec>, StoreError> {
        read_all(&self.db.open_tree(QUEUES_TREE)?)
    }

    pub fn bindings(&self) -> Result<Vec<BindingSpec>, StoreError> {
        read_all(&self.db.open_tree(BINDINGS_TREE)?)
    }

    /// Keys are big-endian ids, so iteration yields messages in queue order.
    pub fn put_message(&self, queue: &str, message: &StoredEnvelope) -> Result<(), StoreError> {
        put_json(&self.queue_tree(queue)?, &message.id.to_be_bytes(), message)
    }

    pub fn remove_message(&self, queue: &str, id: u64) -> Result<(), StoreError> {
        self.queue_tree(queue)?.remove(id.to_be_bytes())?;
        Ok(())
    }

    pub fn messages(&self, queue: &str) -> Result<Vec<StoredEnvelope>, StoreError> {
        read_all(&self.queue_tree(queue)?)
    }

    /// Block until every write so far is on disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn queue_tree(&self, queue: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("queue/{queue}"))?)
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("db", &"sled::Db")
            .finish()
    }
}

fn put_json<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> Result<(), StoreError> {
    tree.insert(key, serde_json::to_vec(value)?)?;
    Ok(())
}

fn read_all<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StoreError> {
    tree.iter()
        .values()
        .map(|value| -> Result<T, StoreError> { Ok(serde_json::from_slice(&value?)?) })
        .collect()
}
