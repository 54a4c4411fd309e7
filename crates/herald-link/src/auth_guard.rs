//! # Authentication Failure Coordinator
//!
//! Counts authentication-class errors in a rolling window and decides when
//! the session must end.
//!
//! ## Escalation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     handle(error, force)                                │
//! │                                                                         │
//! │  handling in flight && !force ───────────────────────► Ignored          │
//! │  logout in progress ─────────────────────────────────► Ignored          │
//! │                                                                         │
//! │  idle > window since last error ──► count = 0                           │
//! │  count += 1, last_error_at = now                                        │
//! │                                                                         │
//! │  not auth-class && !force ───────────────────────────► Recorded         │
//! │  count >= threshold || force ──► clear session ──┐                      │
//! │                                   trigger_all ───┴───► ForcedLogout     │
//! │  graceful callback Ok ───────────────────────────────► GracefulLogout   │
//! │  graceful callback Err / panic / missing ────────────► ForcedLogout     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Classification is structural ([`LinkError::auth_category`]); message text
//! is never inspected. The window lock is never held while user callbacks run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::logout::{CallbackError, LogoutBroadcaster, TriggerReport};
use crate::session::SessionStore;

/// Graceful logout supplied by the host (e.g. call the logout endpoint first).
pub type GracefulLogout = Arc<dyn Fn() -> Result<(), CallbackError> + Send + Sync>;

/// Decision taken for one reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Dropped by the re-entrancy or logout-in-progress guard.
    Ignored,
    /// Counted; no logout.
    Recorded,
    /// The graceful logout callback completed.
    GracefulLogout,
    /// Session cleared and every logout callback triggered.
    ForcedLogout,
}

/// Rolling error counter.
#[derive(Debug, Clone, Default)]
pub struct ErrorWindow {
    pub count: u32,
    pub window_started_at: Option<Instant>,
    pub last_error_at: Option<Instant>,
    pub is_handling: bool,
    pub is_logout_in_progress: bool,
}

pub struct AuthFailureCoordinator {
    window: Mutex<ErrorWindow>,
    threshold: u32,
    idle_reset: Duration,
    session: Arc<SessionStore>,
    broadcaster: Arc<LogoutBroadcaster>,
    graceful: RwLock<Option<GracefulLogout>>,
    forced_logouts: AtomicU64,
}

impl AuthFailureCoordinator {
    /// Creates a coordinator with the given threshold and idle window.
    pub fn new(
        session: Arc<SessionStore>,
        broadcaster: Arc<LogoutBroadcaster>,
        threshold: u32,
        idle_reset: Duration,
    ) -> Self {
        AuthFailureCoordinator {
            window: Mutex::new(ErrorWindow::default()),
            threshold: threshold.max(1),
            idle_reset,
            session,
            broadcaster,
            graceful: RwLock::new(None),
            forced_logouts: AtomicU64::new(0),
        }
    }

    /// Creates a coordinator from the `[auth]` config section.
    pub fn from_config(
        config: &LinkConfig,
        session: Arc<SessionStore>,
        broadcaster: Arc<LogoutBroadcaster>,
    ) -> Self {
        Self::new(
            session,
            broadcaster,
            config.auth.error_threshold,
            config.auth_error_window(),
        )
    }

    /// Installs the graceful logout callback.
    pub fn set_graceful_logout<F>(&self, callback: F)
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        *self
            .graceful
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Removes the graceful logout callback.
    pub fn clear_graceful_logout(&self) {
        *self
            .graceful
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ErrorWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Handling
    // =========================================================================

    /// Records `error` and escalates to logout when warranted.
    pub fn handle(&self, error: &LinkError, force: bool) -> AuthOutcome {
        let category = error.auth_category();

        let escalate = {
            let mut window = self.lock();

            if window.is_handling && !force {
                debug!("Auth error handling already in flight, ignoring");
                return AuthOutcome::Ignored;
            }
            if window.is_logout_in_progress {
                debug!("Logout in progress, ignoring error");
                return AuthOutcome::Ignored;
            }

            let now = Instant::now();
            if let Some(last) = window.last_error_at {
                if now.duration_since(last) > self.idle_reset {
                    debug!(previous = window.count, "Error window expired, resetting count");
                    window.count = 0;
                    window.window_started_at = None;
                }
            }
            window.count += 1;
            window.last_error_at = Some(now);
            window.window_started_at.get_or_insert(now);

            if category.is_none() && !force {
                debug!(count = window.count, error = %error, "Non-auth error recorded");
                return AuthOutcome::Recorded;
            }

            warn!(
                count = window.count,
                threshold = self.threshold,
                category = ?category,
                force,
                "Authentication failure"
            );

            window.is_handling = true;
            if window.count >= self.threshold || force {
                window.is_logout_in_progress = true;
                window.count = 0;
                window.window_started_at = None;
                Escalation::Forced
            } else {
                Escalation::Graceful
            }
        };

        let outcome = match escalate {
            Escalation::Forced => {
                self.forced_logout();
                AuthOutcome::ForcedLogout
            }
            Escalation::Graceful => self.graceful_logout(),
        };

        self.lock().is_handling = false;
        outcome
    }

    fn graceful_logout(&self) -> AuthOutcome {
        let callback = self
            .graceful
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(callback) = callback else {
            debug!("No graceful logout installed, forcing");
            self.begin_forced();
            self.forced_logout();
            return AuthOutcome::ForcedLogout;
        };

        match catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(())) => {
                info!("Graceful logout completed");
                AuthOutcome::GracefulLogout
            }
            Ok(Err(e)) => {
                error!(error = %e, "Graceful logout failed, forcing logout");
                self.begin_forced();
                self.forced_logout();
                AuthOutcome::ForcedLogout
            }
            Err(_) => {
                error!("Graceful logout panicked, forcing logout");
                self.begin_forced();
                self.forced_logout();
                AuthOutcome::ForcedLogout
            }
        }
    }

    fn begin_forced(&self) {
        let mut window = self.lock();
        window.is_logout_in_progress = true;
        window.count = 0;
        window.window_started_at = None;
    }

    /// Clears the session, then runs every logout callback.
    fn forced_logout(&self) -> TriggerReport {
        let identity = self.session.clear();
        let report = self.broadcaster.trigger_all();
        self.forced_logouts.fetch_add(1, Ordering::Relaxed);
        info!(
            identity = ?identity,
            invoked = report.invoked,
            failed = report.failed,
            "Forced logout complete"
        );
        report
    }

    /// Clears the counter and all in-flight flags. Call on identity change.
    pub fn reset_error_count(&self) {
        *self.lock() = ErrorWindow::default();
        debug!("Auth error window reset");
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Errors recorded in the current window.
    pub fn error_count(&self) -> u32 {
        self.lock().count
    }

    pub fn is_logout_in_progress(&self) -> bool {
        self.lock().is_logout_in_progress
    }

    /// Snapshot of the window.
    pub fn window(&self) -> ErrorWindow {
        self.lock().clone()
    }

    /// Forced logouts performed since creation.
    pub fn forced_logout_count(&self) -> u64 {
        self.forced_logouts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AuthFailureCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFailureCoordinator")
            .field("window", &self.window())
            .field("threshold", &self.threshold)
            .field("idle_reset", &self.idle_reset)
            .finish()
    }
}

enum Escalation {
    Forced,
    Graceful,
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{AuthCategory, Session};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        coordinator: Arc<AuthFailureCoordinator>,
        session: Arc<SessionStore>,
        logouts: Arc<AtomicUsize>,
        graceful: Arc<AtomicUsize>,
    }

    fn fixture(with_graceful: bool) -> Fixture {
        let session = Arc::new(SessionStore::new());
        session.set(Session::new("tok", "u-1"));
        let broadcaster = LogoutBroadcaster::new();

        let logouts = Arc::new(AtomicUsize::new(0));
        let l = logouts.clone();
        let s = session.clone();
        broadcaster.register(move || {
            // Session is already cleared when callbacks run.
            assert!(!s.is_signed_in());
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let coordinator = Arc::new(AuthFailureCoordinator::new(
            session.clone(),
            broadcaster,
            3,
            Duration::from_secs(300),
        ));

        let graceful = Arc::new(AtomicUsize::new(0));
        if with_graceful {
            let g = graceful.clone();
            coordinator.set_graceful_logout(move || {
                g.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        Fixture {
            coordinator,
            session,
            logouts,
            graceful,
        }
    }

    fn unauthorized() -> LinkError {
        LinkError::http(401, "Unauthorized")
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_errors_force_exactly_one_logout() {
        let f = fixture(true);

        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::GracefulLogout);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            f.coordinator.handle(&LinkError::auth(AuthCategory::TokenExpired, "exp"), false),
            AuthOutcome::GracefulLogout
        );
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(f.coordinator.handle(&LinkError::http(403, ""), false), AuthOutcome::ForcedLogout);

        // Further errors against the logged-out session are ignored.
        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::Ignored);
        assert_eq!(f.coordinator.handle(&unauthorized(), true), AuthOutcome::Ignored);

        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(f.graceful.load(Ordering::SeqCst), 2);
        assert_eq!(f.coordinator.forced_logout_count(), 1);
        assert!(!f.session.is_signed_in());
        assert!(f.coordinator.is_logout_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_gap_resets_counter() {
        let f = fixture(true);

        f.coordinator.handle(&unauthorized(), false);
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        f.coordinator.handle(&unauthorized(), false);
        assert_eq!(f.coordinator.error_count(), 2);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::GracefulLogout);

        assert_eq!(f.coordinator.error_count(), 1);
        assert_eq!(f.logouts.load(Ordering::SeqCst), 0);
        assert!(f.session.is_signed_in());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flag_logs_out_immediately() {
        let f = fixture(true);
        assert_eq!(
            f.coordinator.handle(&LinkError::Disconnected, true),
            AuthOutcome::ForcedLogout
        );
        assert_eq!(f.graceful.load(Ordering::SeqCst), 0);
        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_auth_errors_are_only_recorded() {
        let f = fixture(false);
        let err = LinkError::ConnectionFailed("401 in the message text".into());
        assert_eq!(f.coordinator.handle(&err, false), AuthOutcome::Recorded);
        assert_eq!(f.coordinator.handle(&LinkError::http(500, ""), false), AuthOutcome::Recorded);
        assert_eq!(f.logouts.load(Ordering::SeqCst), 0);
        assert_eq!(f.coordinator.error_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_graceful_callback_forces() {
        let f = fixture(false);
        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::ForcedLogout);
        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_graceful_callback_falls_back() {
        let f = fixture(false);
        f.coordinator
            .set_graceful_logout(|| Err("logout endpoint unreachable".into()));
        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::ForcedLogout);

        f.coordinator.reset_error_count();
        f.session.set(Session::new("tok2", "u-2"));
        f.coordinator.set_graceful_logout(|| panic!("bridge crashed"));
        assert_eq!(f.coordinator.handle(&unauthorized(), false), AuthOutcome::ForcedLogout);

        assert_eq!(f.logouts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_error_count_rearms() {
        let f = fixture(false);
        f.coordinator.handle(&unauthorized(), false);
        assert!(f.coordinator.is_logout_in_progress());

        f.coordinator.reset_error_count();
        let window = f.coordinator.window();
        assert_eq!(window.count, 0);
        assert!(window.last_error_at.is_none());
        assert!(!window.is_handling);
        assert!(!window.is_logout_in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_report_during_logout_is_ignored() {
        let session = Arc::new(SessionStore::new());
        let broadcaster = LogoutBroadcaster::new();
        let coordinator = Arc::new(AuthFailureCoordinator::new(
            session,
            broadcaster.clone(),
            3,
            Duration::from_secs(300),
        ));

        let inner = Arc::downgrade(&coordinator);
        let nested = Arc::new(Mutex::new(None));
        let n = nested.clone();
        broadcaster.register(move || {
            if let Some(c) = inner.upgrade() {
                *n.lock().unwrap() = Some(c.handle(&LinkError::http(401, ""), false));
            }
            Ok(())
        });

        assert_eq!(coordinator.handle(&unauthorized(), true), AuthOutcome::ForcedLogout);
        assert_eq!(*nested.lock().unwrap(), Some(AuthOutcome::Ignored));
        assert_eq!(coordinator.forced_logout_count(), 1);
    }
}
