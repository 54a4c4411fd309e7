//! # herald-link: Push Channel for Herald
//!
//! Keeps a signed-in client attached to the notification broker over STOMP
//! on WebSocket, and turns inbound frames into a committed notification feed.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Push Channel Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  HeraldClient (host facade)                      │  │
//! │  │  sign_in / sign_out / publish / add_handler / report_error       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Connection     │  │ Notification   │  │ AuthFailure            │    │
//! │  │ Manager        │  │ Aggregator     │  │ Coordinator            │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Driver task,   │  │ Pending patch, │  │ Windowed counter,      │    │
//! │  │ state table,   │  │ one commit per │  │ graceful then forced   │    │
//! │  │ backoff        │  │ tick           │  │ logout                 │    │
//! │  └───────┬────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │          │                                           │                  │
//! │          ▼                                           ▼                  │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Transport      │  │ Subscription   │  │ LogoutBroadcaster      │    │
//! │  │ STOMP over WS  │  │ Registry       │  │ + SessionStore         │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - `HeraldClient` facade and builder
//! - [`connection`] - Connection driver, state table and reconnect policy
//! - [`transport`] - `Connector` trait and the WebSocket implementation
//! - [`protocol`] - STOMP 1.2 frames, decoder and heart-beat negotiation
//! - [`registry`] - Topic handlers with disposers
//! - [`aggregator`] - Notification feed with coalesced commits
//! - [`auth_guard`] - Authentication failure escalation
//! - [`logout`] - Ordered logout callbacks
//! - [`session`] - Current session store
//! - [`notifier`] - Platform notification capability
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Link error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use herald_link::{HeraldClient, LinkConfig};
//!
//! let config = LinkConfig::load_or_default(None);
//! let client = HeraldClient::new(config)?;
//!
//! client.register_logout_callback(|| {
//!     println!("Session expired");
//!     Ok(())
//! });
//! client.sign_in(&token).await?;
//!
//! let mut feed = client.subscribe_feed();
//! while feed.changed().await.is_ok() {
//!     println!("Unread: {}", feed.borrow().unread());
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod aggregator;
pub mod auth_guard;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logout;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testutil;

// =============================================================================
// Re-exports
// =============================================================================

pub use aggregator::NotificationAggregator;
pub use auth_guard::{AuthFailureCoordinator, AuthOutcome, ErrorWindow};
pub use client::{HeraldClient, HeraldClientBuilder};
pub use config::LinkConfig;
pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, DisconnectReason,
};
pub use error::{ErrorKind, LinkError, LinkResult};
pub use logout::{LogoutBroadcaster, LogoutRegistration, TriggerReport};
pub use notifier::{ChannelNotifier, NoOpNotifier, PlatformAlert, PlatformNotifier};
pub use protocol::{Frame, HeartBeat};
pub use registry::{Disposer, SubscriptionId, SubscriptionRegistry};
pub use session::SessionStore;
pub use transport::{Connector, WsConnector};
