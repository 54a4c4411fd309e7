//! # Logout Broadcaster
//!
//! Ordered list of zero-argument callbacks run when the session ends.
//!
//! ```text
//! register(a) ─► [a]
//! register(b) ─► [a, b]
//! register(c) ─► [a, b, c]
//!
//! trigger_all():   a() ──► b() ✗ (logged) ──► c()
//!                  every callback runs once, in registration order
//! ```
//!
//! The caller clears the session before `trigger_all`, so callbacks always
//! observe a logged-out state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, error, info, warn};

/// Error type returned by a failing logout callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Callback run on logout.
pub type LogoutCallback = Arc<dyn Fn() -> Result<(), CallbackError> + Send + Sync>;

/// Outcome of one `trigger_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Callbacks invoked.
    pub invoked: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
}

#[derive(Default)]
pub struct LogoutBroadcaster {
    callbacks: Mutex<Vec<(u64, LogoutCallback)>>,
    next_id: AtomicU64,
}

impl LogoutBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends a callback. The returned handle unregisters it.
    pub fn register<F>(self: &Arc<Self>, callback: F) -> LogoutRegistration
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        debug!(id, "Logout callback registered");

        LogoutRegistration {
            broadcaster: Arc::downgrade(self),
            id,
        }
    }

    fn unregister(&self, id: u64) -> bool {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        before != callbacks.len()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every callback in registration order.
    ///
    /// Failures are logged per callback and never stop the pass. The list is
    /// snapshotted first, so callbacks may register or unregister freely.
    pub fn trigger_all(&self) -> TriggerReport {
        let snapshot: Vec<(u64, LogoutCallback)> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        info!(count = snapshot.len(), "Broadcasting logout");

        let mut report = TriggerReport::default();
        for (id, callback) in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(id, error = %e, "Logout callback failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(id, "Logout callback panicked");
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for LogoutBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogoutBroadcaster")
            .field("callbacks", &self.len())
            .finish()
    }
}

/// Handle returned by [`LogoutBroadcaster::register`].
#[derive(Debug, Clone)]
pub struct LogoutRegistration {
    broadcaster: Weak<LogoutBroadcaster>,
    id: u64,
}

impl LogoutRegistration {
    /// Removes the callback. Returns false if it was already removed.
    pub fn unregister(&self) -> bool {
        self.broadcaster
            .upgrade()
            .map(|b| b.unregister(self.id))
            .unwrap_or(false)
    }
}
