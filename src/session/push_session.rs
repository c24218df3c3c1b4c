use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;

pub type SessionId = String;

#[derive(Debug, Clone)]
pub struct Session {
    /// Unique per connection, never reused.
    pub id: SessionId,

    /// Outbound frames for this connection.
    pub sender: UnboundedSender<WsMessage>,
}

impl Session {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            sender,
        }
    }

    /// Queue a text frame. False once the connection is gone.
    pub fn send_text(&self, text: &str) -> bool {
        self.sender.send(WsMessage::Text(text.into())).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
