//! Prompt inbox feeding a live agent session.
//!
//! A queue of undelivered user messages plus a single waiter slot. The
//! producer task waiting in [`Inbox::next`] is woken either by a new
//! message or by [`Inbox::close`], which makes it return `None`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<String>,
    waiter: Option<oneshot::Sender<()>>,
    closed: bool,
}

/// Shared handle to one session's prompt queue. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    state: Arc<Mutex<InboxState>>,
}

impl Inbox {
    /// Create an empty, open inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` and wake the waiter, if any.
    ///
    /// Returns `false` when the inbox is already closed and the message
    /// was dropped.
    pub async fn push(&self, message: String) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.queue.push_back(message);
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(());
        }
        true
    }

    /// Wait for the next message. Returns `None` once the inbox is closed;
    /// messages still queued at close time are discarded.
    pub async fn next(&self) -> Option<String> {
        loop {
            let wake = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(message) = state.queue.pop_front() {
                    return Some(message);
                }
                let (tx, rx) = oneshot::channel();
                state.waiter = Some(tx);
                rx
            };
            // A dropped sender (replaced waiter) also just re-checks state.
            let _ = wake.await;
        }
    }

    /// Close the inbox and wake the waiter.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.queue.clear();
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(());
        }
    }
}
