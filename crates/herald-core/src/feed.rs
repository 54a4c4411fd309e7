//! # Notification Feed
//!
//! The ordered notification list plus its unread counter, and the
//! [`FeedPatch`] that accumulates mutations until they are committed.
//!
//! ## Pending Patch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Patch Merge & Apply                             │
//! │                                                                         │
//! │  same tick:  prepend(A) ─┐                                              │
//! │              prepend(B) ─┼──► FeedPatch { prepended: [A, B],            │
//! │              mark_read(X)┘               mark_read: [X],                │
//! │                                          unread_delta: 2 }              │
//! │                                                                         │
//! │  flush:      feed.apply(patch)                                          │
//! │              items  = [B, A, ...old]   (most recent first)              │
//! │              unread = old - read(X) + 2                                 │
//! │                                                                         │
//! │  One apply per tick, whatever the number of merged mutations.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//! - Feed order equals receipt order (most recent first)
//! - Items are only ever prepended; `is_read` is the only mutation
//! - Items leave the feed only through `clear` (user switch)

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::notification::Notification;

// =============================================================================
// Feed Patch
// =============================================================================

/// Mutations waiting to be committed to a [`NotificationFeed`].
///
/// Mutations merge in call order: a `reset_unread` discards increments recorded
/// before it, a `clear` discards everything recorded before it.
#[derive(Debug, Clone, Default)]
pub struct FeedPatch {
    clear: bool,
    reset_unread: bool,
    mark_all_read: bool,
    mark_read: Vec<String>,
    prepended: Vec<Notification>,
    unread_delta: usize,
}

impl FeedPatch {
    /// Queues a newly received notification.
    pub fn prepend(&mut self, notification: Notification) {
        if !notification.is_read {
            self.unread_delta += 1;
        }
        self.prepended.push(notification);
    }

    /// Zeroes the unread counter without touching read flags.
    pub fn reset_unread(&mut self) {
        self.reset_unread = true;
        self.unread_delta = 0;
    }

    /// Marks one notification as read.
    pub fn mark_read(&mut self, id: &str) {
        if let Some(pending) = self.prepended.iter_mut().find(|n| n.id == id) {
            if !pending.is_read {
                pending.is_read = true;
                self.unread_delta = self.unread_delta.saturating_sub(1);
            }
            return;
        }
        self.mark_read.push(id.to_string());
    }

    /// Marks every notification as read and zeroes the counter.
    pub fn mark_all_read(&mut self) {
        self.mark_all_read = true;
        self.mark_read.clear();
        for pending in &mut self.prepended {
            pending.is_read = true;
        }
        self.reset_unread();
    }

    /// Empties the feed (user switch).
    pub fn clear(&mut self) {
        *self = FeedPatch {
            clear: true,
            ..FeedPatch::default()
        };
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        !self.clear
            && !self.reset_unread
            && !self.mark_all_read
            && self.mark_read.is_empty()
            && self.prepended.is_empty()
    }

    /// Number of notifications waiting to be prepended.
    pub fn pending_len(&self) -> usize {
        self.prepended.len()
    }
}

// =============================================================================
// Notification Feed
// =============================================================================

/// Notifications, most recent first, with an unread counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    unread: usize,
}

impl NotificationFeed {
    /// Applies a merged patch in one step.
    pub fn apply(&mut self, patch: FeedPatch) {
        let FeedPatch {
            clear,
            reset_unread,
            mark_all_read,
            mark_read,
            prepended,
            unread_delta,
        } = patch;

        if clear {
            self.items.clear();
            self.unread = 0;
        }

        if mark_all_read {
            for item in &mut self.items {
                item.is_read = true;
            }
        }

        if reset_unread {
            self.unread = 0;
        }

        for id in &mark_read {
            if let Some(item) = self.items.iter_mut().find(|n| &n.id == id) {
                if !item.is_read {
                    item.is_read = true;
                    self.unread = self.unread.saturating_sub(1);
                }
            }
        }

        if !prepended.is_empty() {
            let mut items = Vec::with_capacity(prepended.len() + self.items.len());
            items.extend(prepended.into_iter().rev());
            items.append(&mut self.items);
            self.items = items;
        }

        self.unread += unread_delta;
    }

    /// All notifications, most recent first.
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    /// Number of notifications.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the feed has no notifications.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unread counter.
    pub fn unread(&self) -> usize {
        self.unread
    }

    /// Most recently received notification.
    pub fn latest(&self) -> Option<&Notification> {
        self.items.first()
    }

    /// Looks a notification up by id.
    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }
}
