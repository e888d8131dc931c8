use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::session::SessionState;

/// Snapshot of one live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub data_source: Option<String>,
    pub marker_source: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// In-memory table of live sessions.
///
/// Purely observational: sessions report into it, nothing reads it back to
/// make decisions.
#[derive(Clone, Default)]
pub struct SessionTracker {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) {
        let info = SessionInfo {
            id,
            state: SessionState::Discovering,
            data_source: None,
            marker_source: None,
            connected_at: Utc::now(),
        };
        self.sessions.write().insert(id, info);
    }

    pub fn set_state(&self, id: Uuid, state: SessionState) {
        if let Some(info) = self.sessions.write().get_mut(&id) {
            info.state = state;
        }
    }

    pub fn set_sources(&self, id: Uuid, data_source: String, marker_source: Option<String>) {
        if let Some(info) = self.sessions.write().get_mut(&id) {
            info.data_source = Some(data_source);
            info.marker_source = marker_source;
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.sessions.write().remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// All live sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|info| info.connected_at);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let tracker = SessionTracker::new();
        let id = Uuid::new_v4();

        tracker.register(id);
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.get(id).unwrap().state, SessionState::Discovering);

        tracker.set_state(id, SessionState::Streaming);
        tracker.set_sources(id, "EEG-Device".to_string(), None);
        let info = tracker.get(id).unwrap();
        assert_eq!(info.state, SessionState::Streaming);
        assert_eq!(info.data_source.as_deref(), Some("EEG-Device"));

        tracker.remove(id);
        assert_eq!(tracker.count(), 0);
        assert!(tracker.list().is_empty());
    }

    #[test]
    fn test_updates_to_unknown_sessions_are_ignored() {
        let tracker = SessionTracker::new();
        tracker.set_state(Uuid::new_v4(), SessionState::Closed);
        assert_eq!(tracker.count(), 0);
    }
}
