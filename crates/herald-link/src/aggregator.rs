//! # Notification Aggregator
//!
//! Turns inbound frame bodies into [`Notification`]s and commits them to the
//! observable [`NotificationFeed`].
//!
//! ## Scheduled Commit
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Notification Aggregator                           │
//! │                                                                         │
//! │  MESSAGE ──► ingest(body) ──► parse ──✗──► log + drop (dropped_count)   │
//! │                                 │                                       │
//! │                                 ▼                                       │
//! │                        ┌─────────────────┐                              │
//! │  reset_unread_count ──►│  Pending Patch  │  first mutation in a tick:   │
//! │  mark_read(id) ───────►│                 │  commit_pending = true,      │
//! │  mark_all_read ───────►│  prepended: [..]│  spawn deferred flush        │
//! │  reset ───────────────►│  unread_delta   │                              │
//! │                        └────────┬────────┘  later mutations merge in    │
//! │                                 │                                       │
//! │                      flush (after one yield)                            │
//! │                                 ▼                                       │
//! │                 watch::Sender<NotificationFeed>.send_modify(apply)      │
//! │                                 │                                       │
//! │                                 ▼                                       │
//! │                     one observable commit per tick                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fault Isolation
//! A malformed body or a panicking platform notifier never propagates back
//! into the connection driver.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use herald_core::{FeedPatch, Notification, NotificationFeed};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::error::{LinkError, LinkResult};
use crate::notifier::{NoOpNotifier, PlatformNotifier};
use crate::protocol::Frame;

#[derive(Default)]
struct Pending {
    patch: FeedPatch,
    commit_pending: bool,
}

struct Inner {
    pending: Mutex<Pending>,
    feed_tx: watch::Sender<NotificationFeed>,
    notifier: Arc<dyn PlatformNotifier>,
    platform_enabled: AtomicBool,
    commits: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    /// Applies the pending patch as one commit.
    ///
    /// The pending lock is held while applying so commits land in the order
    /// their mutations were recorded.
    fn flush(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.commit_pending = false;
        let patch = mem::take(&mut pending.patch);
        if patch.is_empty() {
            return;
        }

        let added = patch.pending_len();
        self.feed_tx.send_modify(|feed| feed.apply(patch));
        let commits = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(added, commits, "Feed committed");
    }
}

/// Feed owner and inbound-frame sink. Cheap to clone.
#[derive(Clone)]
pub struct NotificationAggregator {
    inner: Arc<Inner>,
}

impl Default for NotificationAggregator {
    fn default() -> Self {
        Self::new(Arc::new(NoOpNotifier))
    }
}

impl NotificationAggregator {
    /// Creates an aggregator that forwards new items to `notifier`.
    pub fn new(notifier: Arc<dyn PlatformNotifier>) -> Self {
        let (feed_tx, _) = watch::channel(NotificationFeed::default());
        NotificationAggregator {
            inner: Arc::new(Inner {
                pending: Mutex::new(Pending::default()),
                feed_tx,
                notifier,
                platform_enabled: AtomicBool::new(true),
                commits: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Switches platform notifications on or off.
    pub fn set_platform_enabled(&self, enabled: bool) {
        self.inner.platform_enabled.store(enabled, Ordering::Relaxed);
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Parses one inbound body and queues the resulting notification.
    ///
    /// A parse failure is logged, counted and returned; feed and counter are
    /// untouched.
    pub fn ingest(&self, body: &str) -> LinkResult<()> {
        let notification = match Notification::parse(body, Utc::now()) {
            Ok(n) => n,
            Err(e) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = body.len(), "Dropping malformed notification");
                return Err(LinkError::MalformedPayload(e.to_string()));
            }
        };

        debug!(id = %notification.id, category = %notification.category, "Notification received");
        self.notify_platform(&notification);
        self.mutate(|patch| patch.prepend(notification));
        Ok(())
    }

    /// Frame handler for the subscription registry.
    pub fn frame_handler(&self) -> impl Fn(&Frame) + Send + Sync + 'static {
        let aggregator = self.clone();
        move |frame: &Frame| {
            // Already logged and counted.
            let _ = aggregator.ingest(&frame.body);
        }
    }

    fn notify_platform(&self, notification: &Notification) {
        if !self.inner.platform_enabled.load(Ordering::Relaxed) {
            return;
        }
        let notifier = &self.inner.notifier;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if notifier.is_enabled() {
                notifier.notify(&notification.title, &notification.body);
            }
        }));
        if outcome.is_err() {
            error!(id = %notification.id, "Platform notifier panicked");
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Zeroes the unread counter.
    pub fn reset_unread_count(&self) {
        self.mutate(FeedPatch::reset_unread);
    }

    /// Marks one notification as read.
    pub fn mark_read(&self, id: &str) {
        self.mutate(|patch| patch.mark_read(id));
    }

    /// Marks every notification as read.
    pub fn mark_all_read(&self) {
        self.mutate(FeedPatch::mark_all_read);
    }

    /// Empties the feed (user switch).
    pub fn reset(&self) {
        self.mutate(FeedPatch::clear);
    }

    /// Records a mutation and schedules a commit if none is pending.
    fn mutate(&self, f: impl FnOnce(&mut FeedPatch)) {
        let schedule = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            f(&mut pending.patch);
            !mem::replace(&mut pending.commit_pending, true)
        };

        if schedule {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    // Let the rest of this tick merge into the patch.
                    tokio::task::yield_now().await;
                    inner.flush();
                });
            }
            Err(_) => self.inner.flush(),
        }
    }

    /// Commits any pending mutations immediately.
    pub fn flush_now(&self) {
        self.inner.flush();
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Watches committed feed states.
    pub fn subscribe(&self) -> watch::Receiver<NotificationFeed> {
        self.inner.feed_tx.subscribe()
    }

    /// Snapshot of the last committed feed.
    pub fn feed(&self) -> NotificationFeed {
        self.inner.feed_tx.borrow().clone()
    }

    /// Committed unread counter.
    pub fn unread(&self) -> usize {
        self.inner.feed_tx.borrow().unread()
    }

    /// Number of commits so far.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of malformed bodies dropped.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Returns true if mutations are waiting for a commit.
    pub fn has_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commit_pending
    }
}

impl std::fmt::Debug for NotificationAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationAggregator")
            .field("commits", &self.commit_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChannelNotifier;

    fn body(title: &str) -> String {
        format!(
            r#"{{"title":"{}","content":"B","notificationType":"SYSTEM"}}"#,
            title
        )
    }

    #[tokio::test]
    async fn test_same_tick_mutations_coalesce() {
        let aggregator = NotificationAggregator::default();
        let mut rx = aggregator.subscribe();

        for i in 0..5 {
            aggregator.ingest(&body(&format!("n{}", i))).unwrap();
        }
        aggregator.mark_read("unknown");
        assert!(aggregator.has_pending());
        assert_eq!(aggregator.commit_count(), 0);

        rx.changed().await.unwrap();
        assert_eq!(aggregator.commit_count(), 1);
        assert!(!aggregator.has_pending());

        let feed = rx.borrow_and_update().clone();
        assert_eq!(feed.len(), 5);
        assert_eq!(feed.unread(), 5);
        let titles: Vec<&str> = feed.items().iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["n4", "n3", "n2", "n1", "n0"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_leaves_feed_unchanged() {
        let aggregator = NotificationAggregator::default();
        aggregator.ingest(&body("A")).unwrap();
        aggregator.flush_now();

        let err = aggregator.ingest("{not json").unwrap_err();
        assert!(matches!(err, LinkError::MalformedPayload(_)));
        assert!(aggregator
            .ingest(r#"{"title":"only title"}"#)
            .is_err());

        assert!(!aggregator.has_pending());
        aggregator.flush_now();
        assert_eq!(aggregator.feed().len(), 1);
        assert_eq!(aggregator.unread(), 1);
        assert_eq!(aggregator.dropped_count(), 2);
        assert_eq!(aggregator.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_receipt_order_across_commits() {
        let aggregator = NotificationAggregator::default();
        let mut rx = aggregator.subscribe();

        for i in 0..3 {
            aggregator.ingest(&body(&format!("n{}", i))).unwrap();
            rx.changed().await.unwrap();
        }

        let feed = aggregator.feed();
        assert_eq!(feed.unread(), 3);
        assert_eq!(feed.items()[0].title, "n2");
        assert_eq!(feed.items()[2].title, "n0");
        assert_eq!(aggregator.commit_count(), 3);
    }

    #[tokio::test]
    async fn test_reset_unread_and_mark_read() {
        let aggregator = NotificationAggregator::default();
        aggregator.ingest(&body("a")).unwrap();
        aggregator.ingest(&body("b")).unwrap();
        aggregator.flush_now();
        assert_eq!(aggregator.unread(), 2);

        let id = aggregator.feed().items()[1].id.clone();
        aggregator.mark_read(&id);
        aggregator.flush_now();
        assert_eq!(aggregator.unread(), 1);
        assert!(aggregator.feed().get(&id).unwrap().is_read);

        aggregator.reset_unread_count();
        aggregator.flush_now();
        assert_eq!(aggregator.unread(), 0);
        assert_eq!(aggregator.feed().len(), 2);

        aggregator.reset();
        aggregator.flush_now();
        assert!(aggregator.feed().is_empty());
    }

    #[test]
    fn test_flushes_synchronously_without_runtime() {
        let aggregator = NotificationAggregator::default();
        aggregator.ingest(&body("A")).unwrap();
        assert_eq!(aggregator.commit_count(), 1);
        let feed = aggregator.feed();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.unread(), 1);
        assert_eq!(feed.items()[0].title, "A");
    }

    #[tokio::test]
    async fn test_platform_notifier_invoked() {
        let (notifier, mut alerts) = ChannelNotifier::new(8);
        let aggregator = NotificationAggregator::new(Arc::new(notifier));

        aggregator.ingest(&body("Class moved")).unwrap();
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.title, "Class moved");
        assert_eq!(alert.body, "B");

        aggregator.set_platform_enabled(false);
        aggregator.ingest(&body("quiet")).unwrap();
        assert!(alerts.try_recv().is_err());
    }

    struct PanickingNotifier;

    impl PlatformNotifier for PanickingNotifier {
        fn notify(&self, _title: &str, _body: &str) {
            panic!("platform bridge crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_notifier_is_isolated() {
        let aggregator = NotificationAggregator::new(Arc::new(PanickingNotifier));
        aggregator.ingest(&body("A")).unwrap();
        aggregator.flush_now();
        assert_eq!(aggregator.feed().len(), 1);
    }
}
