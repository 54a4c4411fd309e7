//! Holder for the current [`Session`].
//!
//! Cleared synchronously on logout, before any logout callback runs.

use std::sync::{PoisonError, RwLock};

use herald_core::Session;
use tokio::sync::watch;
use tracing::info;

/// Current session, observable through a watch channel.
#[derive(Debug)]
pub struct SessionStore {
    current: RwLock<Option<Session>>,
    changes: watch::Sender<Option<String>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        let (changes, _) = watch::channel(None);
        SessionStore {
            current: RwLock::new(None),
            changes,
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current session.
    pub fn set(&self, session: Session) {
        info!(identity = %session.identity, "Session established");
        let identity = session.identity.clone();
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.changes.send_replace(Some(identity));
    }

    /// Drops the current session. Returns the identity that was signed in.
    pub fn clear(&self) -> Option<String> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ref s) = previous {
            info!(identity = %s.identity, "Session cleared");
        }
        self.changes.send_replace(None);
        previous.map(|s| s.identity)
    }

    /// Clone of the current session.
    pub fn current(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current bearer token.
    pub fn token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.token.clone())
    }

    /// Current identity.
    pub fn identity(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.identity.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Watches the signed-in identity (`None` when logged out).
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.changes.subscribe()
    }
}
