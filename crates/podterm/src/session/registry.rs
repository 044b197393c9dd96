//! In-memory index of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::models::{TerminalAccessData, TerminalStatus};
use crate::exec::ActivityClock;

/// A live session as tracked in memory.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub data: TerminalAccessData,
    /// Exec session currently handed out for this pod.
    pub exec_session_id: Option<String>,
    pub activity: Arc<ActivityClock>,
    pub registered_at: DateTime<Utc>,
}

impl LiveSession {
    pub fn new(data: TerminalAccessData) -> Self {
        Self {
            data,
            exec_session_id: None,
            activity: Arc::new(ActivityClock::new()),
            registered_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TerminalStatus {
        self.data.status
    }
}

/// Terminal access id → live session, behind one readers-writer lock.
///
/// Entries are only ever inserted while live; [`SessionRegistry::remove_terminal`] drops the
/// ones that have since sunk.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<i64, LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Sessions that are not live are refused.
    pub async fn insert(&self, session: LiveSession) -> bool {
        if !session.status().is_live() {
            return false;
        }
        self.inner.write().await.insert(session.data.id, session);
        true
    }

    pub async fn get(&self, id: i64) -> Option<LiveSession> {
        self.inner.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: i64) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    pub async fn snapshot(&self) -> Vec<LiveSession> {
        let mut sessions: Vec<LiveSession> = self.inner.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.data.id);
        sessions
    }

    /// Apply `f` to an entry. Returns false if the id is not registered.
    pub async fn update<F>(&self, id: i64, f: F) -> bool
    where
        F: FnOnce(&mut LiveSession),
    {
        match self.inner.write().await.get_mut(&id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: i64) -> Option<LiveSession> {
        self.inner.write().await.remove(&id)
    }

    /// Drop every entry whose status is no longer Starting/Running. Returns the dropped ids.
    pub async fn remove_terminal(&self) -> Vec<i64> {
        let mut map = self.inner.write().await;
        let sunk: Vec<i64> = map
            .iter()
            .filter(|(_, s)| s.status().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &sunk {
            map.remove(id);
        }
        sunk
    }

    /// Live entries owned by `user_id`.
    pub async fn list_for_user(&self, user_id: i64) -> Vec<LiveSession> {
        let mut sessions: Vec<LiveSession> = self
            .inner
            .read()
            .await
            .values()
            .filter(|s| s.data.user_id == user_id && s.status().is_live())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.data.id);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
