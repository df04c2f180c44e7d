//! Seen-call store shared by the push and poll paths

use crate::models::CallId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Call ids already surfaced this session. Clones share the same set.
///
/// Never pruned: the backend does not reuse call ids.
#[derive(Debug, Clone, Default)]
pub struct SeenCalls {
    ids: Arc<Mutex<HashSet<CallId>>>,
}

impl SeenCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, id: CallId) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn mark_seen(&self, id: CallId) {
        self.ids.lock().insert(id);
    }

    /// Check-then-set under one lock. Returns `true` only for the first caller
    /// to claim `id`; every producer must go through this before surfacing a call.
    pub fn claim(&self, id: CallId) -> bool {
        self.ids.lock().insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}
