//! # reportbus
//!
//! Asynchronous report generation over a message broker. A report request is
//! published to the report topic, a worker builds and uploads the report, and
//! the completion event travels over the notification topic to the websocket
//! sessions of the user who asked for it.
//!
//! ## Modules
//!
//! - `broker`: topic topology, confirmed publishing, the prefetch-bounded
//!   consumer, the RabbitMQ adapter and an in-process broker.
//! - `config`: settings loaded once at startup.
//! - `persistence`: sled store behind the in-process broker's durability.
//! - `pipeline`: message schemas, the report worker, the notification router,
//!   dead-letter replay and the process roles.
//! - `report`: report content and the producer that uploads it.
//! - `session`: one connected push session.
//! - `storage`: the object storage collaborator and its S3 client.
//! - `transport`: websocket push server and the user-id session hub.
//! - `utils`: errors, logging and trace propagation.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;
