//! Text delta reconciliation.
//!
//! Backends report the full text of a message so far; the frontend wants
//! only what is new. For previous text `P` and new full text `F`:
//! if `F` starts with `P` the delta is the suffix, otherwise the backend
//! rewrote earlier text and the delta is all of `F`. Either way `P := F`.

use std::collections::HashMap;

/// Last-seen full text for one stream.
#[derive(Debug, Default, Clone)]
pub struct TextBuffer {
    last: String,
}

impl TextBuffer {
    /// Record `full` and return the part the consumer has not seen.
    pub fn reconcile(&mut self, full: &str) -> String {
        let delta = full
            .strip_prefix(self.last.as_str())
            .unwrap_or(full)
            .to_owned();
        full.clone_into(&mut self.last);
        delta
    }

    /// Whether `full` revises text already seen rather than extending it.
    #[must_use]
    pub fn rewrites(&self, full: &str) -> bool {
        !full.starts_with(self.last.as_str())
    }

    /// Forget everything seen so far.
    pub fn clear(&mut self) {
        self.last.clear();
    }
}

/// One [`TextBuffer`] per backend item id.
#[derive(Debug, Default, Clone)]
pub struct ItemBuffers {
    items: HashMap<String, TextBuffer>,
}

impl ItemBuffers {
    /// Reconcile `full` against the previous text of `item_id`.
    pub fn reconcile(&mut self, item_id: &str, full: &str) -> String {
        self.items
            .entry(item_id.to_owned())
            .or_default()
            .reconcile(full)
    }

    /// Whether `full` revises what was seen for `item_id`.
    #[must_use]
    pub fn rewrites(&self, item_id: &str, full: &str) -> bool {
        self.items
            .get(item_id)
            .is_some_and(|buffer| buffer.rewrites(full))
    }

    /// Drop all item buffers.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
