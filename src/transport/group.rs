use std::collections::HashSet;

use crate::session::SessionId;

/// The sessions that announced one user id.
#[derive(Debug, Default)]
pub struct Group {
    pub user_id: String,
    pub sessions: HashSet<SessionId>,
}

impl Group {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sessions: HashSet::new(),
        }
    }

    /// Joining twice has no effect.
    pub fn join(&mut self, id: SessionId) {
        self.sessions.insert(id);
    }

    pub fn leave(&mut self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
