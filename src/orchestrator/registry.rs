//! Per-backend session registry.
//!
//! Maps a session id to its mutable state. Each entry sits behind its own
//! lock so that work on one session never waits on another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Shared handle to one session's state.
pub type SessionHandle<S> = Arc<Mutex<S>>;

/// Session id → state map for one orchestrator.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<String, SessionHandle<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `session_id`, creating it with `create` on first
    /// reference.
    pub async fn get_or_insert_with<F>(&self, session_id: &str, create: F) -> SessionHandle<S>
    where
        F: FnOnce() -> S,
    {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(create()))),
        )
    }

    /// Look up an existing entry.
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle<S>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Remove and return an entry.
    pub async fn remove(&self, session_id: &str) -> Option<SessionHandle<S>> {
        self.sessions.lock().await.remove(session_id)
    }

    /// Snapshot of every entry, for shutdown sweeps.
    pub async fn entries(&self) -> Vec<(String, SessionHandle<S>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }
}
