//! Active Session Registry
//!
//! Maps session ids to live sessions. One exclusive lock guards every
//! insert, removal and iteration; [`SessionRegistry::take`] is the atomic
//! "look up then remove" the close protocol relies on.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::network::session::{MatchSession, SessionId};

/// Set of active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<SessionId, Arc<MatchSession>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its id.
    pub async fn register(&self, session: Arc<MatchSession>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.clone(), session);
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<MatchSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Remove and return a session. Of several concurrent callers for the
    /// same id, exactly one gets `Some`.
    pub async fn take(&self, id: &SessionId) -> Option<Arc<MatchSession>> {
        self.sessions.lock().await.remove(id)
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Ids of all active sessions.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().cloned().collect()
    }
}
