//! Explicit session context and 401 propagation

use crate::models::Role;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Who is signed in. Passed to every component instead of read from ambient storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: u64,
    pub role: Role,
    pub token: String,
}

impl Session {
    pub fn new(user_id: u64, role: Role, token: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            token: token.into(),
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Shared flag flipped by the first 401 any component observes.
///
/// The host owns the reaction (clear persisted session, ask for a new login);
/// the core only reports.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn invalidate(&self) {
        let changed = self.tx.send_if_modified(|invalid| {
            let was = *invalid;
            *invalid = true;
            !was
        });
        if changed {
            tracing::warn!("Session invalidated by backend (401)");
        }
    }

    pub fn is_invalidated(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
