//! A connected push-transport session.
//!
//! The hub owns one `Session` per websocket connection; the connection task
//! drains the other end of `sender` into the socket.

mod push_session;

pub use push_session::{Session, SessionId};

#[cfg(test)]
mod tests;
