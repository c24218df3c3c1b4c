use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::session::{Session, SessionId};
use crate::transport::group::Group;
use crate::transport::message::ServerMessage;
use crate::transport::{PushTransport, TransportError};

/// Live sessions and the user groups they announced.
#[derive(Debug, Default)]
pub struct SessionHub {
    sessions: HashMap<SessionId, Session>,
    groups: HashMap<String, Group>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_session(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Forget a session and drop it from every group; groups left empty go
    /// away with it.
    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.groups.retain(|_, group| {
            group.leave(session_id);
            !group.is_empty()
        });
    }

    pub fn announce_identity(
        &mut self,
        session_id: &str,
        user_id: &str,
    ) -> Result<(), TransportError> {
        if !self.sessions.contains_key(session_id) {
            return Err(TransportError::UnknownSession(session_id.to_string()));
        }
        self.groups
            .entry(user_id.to_string())
            .or_insert_with(|| Group::new(user_id))
            .join(session_id.to_string());
        Ok(())
    }

    pub fn deliver_to_group(&self, user_id: &str, message: &ServerMessage) -> usize {
        let Some(group) = self.groups.get(user_id) else {
            return 0;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "could not serialize push message");
                return 0;
            }
        };

        group
            .sessions
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|session| {
                let sent = session.send_text(&text);
                if !sent {
                    debug!(session_id = %session.id, "session closed before delivery");
                }
                sent
            })
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn group_size(&self, user_id: &str) -> usize {
        self.groups.get(user_id).map_or(0, |g| g.sessions.len())
    }
}

/// Shared handle over the hub, used by connection tasks and the router.
#[derive(Debug, Clone, Default)]
pub struct HubHandle(Arc<Mutex<SessionHub>>);

impl HubHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionHub> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_session(&self, session: Session) {
        self.lock().register_session(session);
    }

    pub fn remove_session(&self, session_id: &str) {
        self.lock().remove_session(session_id);
    }
}

impl PushTransport for HubHandle {
    fn announce_identity(&self, session_id: &str, user_id: &str) -> Result<(), TransportError> {
        self.lock().announce_identity(session_id, user_id)
    }

    fn deliver_to_group(&self, user_id: &str, message: &ServerMessage) -> usize {
        self.lock().deliver_to_group(user_id, message)
    }
}
