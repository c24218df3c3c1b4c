//! Durable storage for the in-process broker.
//!
//! Durable exchanges, queues and bindings, and every persistent message still
//! owned by a durable queue (ready or delivered but unacknowledged), are kept
//! in an embedded `sled` database so a broker reopened on the same directory
//! picks up where it stopped.

pub mod sled_store;

pub use sled_store::{MessageStore, StoreError, StoredEnvelope};

#[cfg(test)]
mod tests;
