//! Push transport: the websocket server clients connect to and the hub that
//! maps announced user ids to their live sessions.
//!
//! Subscriptions exist only while a session is connected. Nothing here is
//! persisted.

pub mod group;
pub mod hub;
pub mod message;
pub mod websocket;

use thiserror::Error;

pub use hub::{HubHandle, SessionHub};
pub use message::{ClientMessage, ServerMessage};
pub use websocket::{bind, serve};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown session {0}")]
    UnknownSession(String),
}

/// The side of the push transport the notification router talks to.
pub trait PushTransport: Send + Sync + 'static {
    /// Subscribe `session_id` to the group for `user_id`.
    fn announce_identity(&self, session_id: &str, user_id: &str) -> Result<(), TransportError>;

    /// Best-effort delivery to every session in the group. Returns how many
    /// sessions the message was queued for; zero is not an error.
    fn deliver_to_group(&self, user_id: &str, message: &ServerMessage) -> usize;
}
