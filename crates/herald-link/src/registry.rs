//! # Subscription Registry
//!
//! Topic → handler map used by the connection driver to deliver inbound
//! `MESSAGE` frames.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Subscription Registry                             │
//! │                                                                         │
//! │  add_handler("/topic/a", h1)  ──► { "/topic/a": (sub-1, h1) }           │
//! │  add_handler("/topic/a", h2)  ──► { "/topic/a": (sub-2, h2) }  (LWW)    │
//! │                                                                         │
//! │  disposer(sub-1).dispose()    ──► no-op (sub-1 was overwritten)         │
//! │  disposer(sub-2).dispose()    ──► { }                                   │
//! │                                                                         │
//! │  clear()  (on disconnect)     ──► { }   every disposer becomes a no-op  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One handler per topic. Handlers are invoked outside the lock, so a
//! handler may add or dispose registrations.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, error, trace};

use crate::protocol::Frame;

/// Callback invoked with every frame delivered to a topic.
pub type MessageHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Identifier of one registration; also used as the STOMP subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Entry {
    id: SubscriptionId,
    handler: MessageHandler,
}

// =============================================================================
// Registry
// =============================================================================

/// Topic-keyed handler registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: RwLock<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for `topic`, replacing any previous handler.
    pub fn add_handler<F>(self: &Arc<Self>, topic: impl Into<String>, handler: F) -> Disposer
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                topic.clone(),
                Entry {
                    id,
                    handler: Arc::new(handler),
                },
            );

        match previous {
            Some(old) => debug!(topic = %topic, old = %old.id, new = %id, "Handler replaced"),
            None => debug!(topic = %topic, id = %id, "Handler registered"),
        }

        Disposer {
            registry: Arc::downgrade(self),
            topic,
            id,
        }
    }

    /// Removes the handler for `topic` if it is still registration `id`.
    pub fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.get(topic).map(|e| e.id) == Some(id) {
            handlers.remove(topic);
            debug!(topic = %topic, id = %id, "Handler disposed");
            true
        } else {
            false
        }
    }

    /// Drops every handler.
    pub fn clear(&self) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !handlers.is_empty() {
            debug!(count = handlers.len(), "Clearing all handlers");
        }
        handlers.clear();
    }

    /// Current registrations, sorted by id.
    pub fn subscriptions(&self) -> Vec<(String, SubscriptionId)> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut subs: Vec<_> = handlers
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.id))
            .collect();
        subs.sort_by_key(|(_, id)| *id);
        subs
    }

    /// Registration id for `topic`.
    pub fn id_of(&self, topic: &str) -> Option<SubscriptionId> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|e| e.id)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.id_of(topic).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a `MESSAGE` frame.
    ///
    /// The handler is looked up by `destination`, then by `subscription` id.
    /// Returns false when no handler matched. A panicking handler is logged
    /// and treated as delivered.
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            let by_destination = frame
                .destination()
                .and_then(|d| handlers.get(d))
                .map(|e| e.handler.clone());
            by_destination.or_else(|| {
                let sub = frame.subscription()?;
                handlers
                    .values()
                    .find(|e| e.id.to_string() == sub)
                    .map(|e| e.handler.clone())
            })
        };

        let Some(handler) = handler else {
            debug!(
                destination = ?frame.destination(),
                subscription = ?frame.subscription(),
                "No handler for inbound frame, dropping"
            );
            return false;
        };

        trace!(destination = ?frame.destination(), "Dispatching frame");
        if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
            error!(destination = ?frame.destination(), "Message handler panicked");
        }
        true
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

// =============================================================================
// Disposer
// =============================================================================

/// Removes one registration when disposed.
///
/// A disposer for a registration that was overwritten or cleared is a no-op.
#[derive(Debug, Clone)]
pub struct Disposer {
    registry: Weak<SubscriptionRegistry>,
    topic: String,
    id: SubscriptionId,
}

impl Disposer {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the registration. Returns true if it was still current.
    pub fn dispose(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.topic, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::sync::Mutex;

    fn message(destination: &str, body: &str) -> Frame {
        Frame::new(Command::Message)
            .header("destination", destination)
            .with_body(body)
    }

    #[test]
    fn test_dispatch_by_destination() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.add_handler("/topic/a", move |f| sink.lock().unwrap().push(f.body.clone()));

        assert!(registry.dispatch(&message("/topic/a", "one")));
        assert!(!registry.dispatch(&message("/topic/b", "two")));
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string()]);
    }

    #[test]
    fn test_last_write_wins() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = hits.clone();
        let first = registry.add_handler("/topic/a", move |_| h.lock().unwrap().push("first"));
        let h = hits.clone();
        let second = registry.add_handler("/topic/a", move |_| h.lock().unwrap().push("second"));

        registry.dispatch(&message("/topic/a", ""));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
        assert_eq!(registry.len(), 1);

        // The stale disposer must not remove the newer handler.
        assert!(!first.dispose());
        assert!(registry.contains("/topic/a"));
        assert!(second.dispose());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_makes_disposers_noops() {
        let registry = SubscriptionRegistry::new();
        let disposer = registry.add_handler("/topic/a", |_| {});
        registry.clear();
        assert!(registry.is_empty());
        assert!(!disposer.dispose());

        // A new registration for the same topic survives the old disposer.
        let old = registry.add_handler("/topic/b", |_| {});
        registry.clear();
        registry.add_handler("/topic/b", |_| {});
        assert!(!old.dispose());
        assert!(registry.contains("/topic/b"));
    }

    #[test]
    fn test_dispatch_by_subscription_fallback() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let disposer = registry.add_handler("/user/queue/notifications", move |_| {
            *s.lock().unwrap() += 1;
        });

        let frame = Frame::new(Command::Message)
            .header("destination", "/user/u-1/queue/notifications")
            .header("subscription", disposer.id().to_string());
        assert!(registry.dispatch(&frame));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = SubscriptionRegistry::new();
        registry.add_handler("/topic/a", |_| panic!("handler bug"));
        assert!(registry.dispatch(&message("/topic/a", "")));
        // Registry still usable.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handler_can_register_during_dispatch() {
        let registry = SubscriptionRegistry::new();
        let inner = registry.clone();
        registry.add_handler("/topic/a", move |_| {
            inner.add_handler("/topic/b", |_| {});
        });
        registry.dispatch(&message("/topic/a", ""));
        assert!(registry.contains("/topic/b"));
    }

    #[test]
    fn test_subscriptions_sorted_by_id() {
        let registry = SubscriptionRegistry::new();
        let a = registry.add_handler("/z", |_| {});
        let b = registry.add_handler("/a", |_| {});
        let subs = registry.subscriptions();
        assert_eq!(subs, vec![("/z".to_string(), a.id()), ("/a".to_string(), b.id())]);
        assert_eq!(a.id().to_string(), "sub-1");
    }
}
