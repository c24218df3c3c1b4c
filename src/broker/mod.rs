//! Broker plumbing: topic topology, envelopes, the channel seam and its two
//! implementations, confirmed publishing and the consumption loop.

pub mod amqp;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod topology;

pub use channel::{BrokerChannel, BrokerError, ChannelHandle, Connector, SharedChannel};
pub use connection::{RetryPolicy, connect_with_retry};
pub use consumer::{Consumer, ConsumerReport, DeliveryHandler, Disposition};
pub use envelope::{Delivery, Envelope};
pub use publisher::Publisher;
pub use topology::{Topic, ensure_topic};
