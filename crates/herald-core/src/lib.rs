//! # herald-core: Pure Domain Types for Herald
//!
//! This crate holds the domain model of the push-notification channel with
//! zero I/O dependencies. Everything here is deterministic and can be tested
//! without a broker, a socket or an async runtime.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Herald Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Host App (mobile shell)                      │   │
//! │  │      sign in ──► feed badge ──► notification list ──► logout    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    herald-link (push channel)                   │   │
//! │  │   ConnectionManager, Registry, Aggregator, AuthGuard, Logout    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ herald-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌──────────────┐  ┌───────────┐  ┌─────────┐  │   │
//! │  │   │  session  │  │ notification │  │   feed    │  │  error  │  │   │
//! │  │   │  Session  │  │ Notification │  │ Feed      │  │ AuthCat │  │   │
//! │  │   │  Claims   │  │ Payload      │  │ FeedPatch │  │ CoreErr │  │   │
//! │  │   └───────────┘  └──────────────┘  └───────────┘  └─────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] - Authenticated session (bearer token + identity)
//! - [`notification`] - Notification and inbound payload shape
//! - [`feed`] - Notification feed and the pending patch that mutates it
//! - [`error`] - Domain error types and the authentication taxonomy
//!
//! ## Example Usage
//!
//! ```rust
//! use herald_core::feed::{FeedPatch, NotificationFeed};
//! use herald_core::notification::{Notification, NotificationPayload};
//!
//! let payload = NotificationPayload::from_json(
//!     r#"{"title":"A","content":"B","notificationType":"SYSTEM"}"#,
//! ).unwrap();
//!
//! let mut patch = FeedPatch::default();
//! patch.prepend(Notification::from_payload(payload, chrono::Utc::now()));
//!
//! let mut feed = NotificationFeed::default();
//! feed.apply(patch);
//!
//! assert_eq!(feed.len(), 1);
//! assert_eq!(feed.unread(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod feed;
pub mod notification;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{AuthCategory, CoreError, CoreResult};
pub use feed::{FeedPatch, NotificationFeed};
pub use notification::{Notification, NotificationPayload};
pub use session::Session;
