//! # Herald Client
//!
//! Host-facing facade. Wires the session store, connection manager,
//! notification aggregator, auth coordinator and logout broadcaster together.
//!
//! ## Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        HeraldClient Wiring                              │
//! │                                                                         │
//! │   sign_in(token) ──► SessionStore ──► ConnectionHandle::connect         │
//! │                                              │                          │
//! │                         handshake ───────────┤                          │
//! │                                              ▼                          │
//! │                 SubscriptionRegistry ── default topic ──► Aggregator    │
//! │                                                               │         │
//! │                                          watch<NotificationFeed>        │
//! │                                                                         │
//! │   report_error(e) ──► AuthFailureCoordinator                            │
//! │                           │ forced                                      │
//! │                           ▼                                             │
//! │                 SessionStore::clear ──► LogoutBroadcaster::trigger_all  │
//! │                                           │ (first callback)            │
//! │                                           ▼                             │
//! │                                  ConnectionHandle::end_session          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_core::{NotificationFeed, Session};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregator::NotificationAggregator;
use crate::auth_guard::{AuthFailureCoordinator, AuthOutcome};
use crate::config::LinkConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::{LinkError, LinkResult};
use crate::logout::{CallbackError, LogoutBroadcaster, LogoutRegistration, TriggerReport};
use crate::notifier::{NoOpNotifier, PlatformNotifier};
use crate::protocol::Frame;
use crate::registry::{Disposer, SubscriptionRegistry};
use crate::session::SessionStore;
use crate::transport::{Connector, WsConnector};

/// Default attempts for [`HeraldClient::publish_with_retry`].
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

/// Default base delay for [`HeraldClient::publish_with_retry`].
pub const DEFAULT_PUBLISH_BACKOFF: Duration = Duration::from_millis(500);

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`HeraldClient`].
pub struct HeraldClientBuilder {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    notifier: Arc<dyn PlatformNotifier>,
}

impl HeraldClientBuilder {
    /// Replaces the WebSocket connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Installs a platform notification capability.
    pub fn notifier(mut self, notifier: Arc<dyn PlatformNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validates the configuration and starts the connection driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> LinkResult<HeraldClient> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let session = Arc::new(SessionStore::new());
        let broadcaster = LogoutBroadcaster::new();
        let registry = SubscriptionRegistry::new();

        let aggregator = NotificationAggregator::new(self.notifier);
        aggregator.set_platform_enabled(config.notifications.platform_enabled);

        let auth_guard = Arc::new(AuthFailureCoordinator::from_config(
            &config,
            session.clone(),
            broadcaster.clone(),
        ));

        let connection = ConnectionManager::new((*config).clone(), self.connector)
            .with_registry(registry)
            .with_aggregator(aggregator.clone())
            .with_auth_guard(auth_guard.clone())
            .spawn();

        // Registered first so the link is torn down before host callbacks run.
        let teardown = {
            let connection = connection.clone();
            let aggregator = aggregator.clone();
            broadcaster.register(move || {
                connection.request_end_session()?;
                aggregator.reset();
                Ok(())
            })
        };

        info!(
            url = ?config.broker_url(),
            outbound = %config.outbound_topic(),
            "Herald client ready"
        );

        Ok(HeraldClient {
            config,
            session,
            broadcaster,
            auth_guard,
            aggregator,
            connection,
            _teardown: teardown,
        })
    }
}

// =============================================================================
// Herald Client
// =============================================================================

/// Push-notification client for one host application.
pub struct HeraldClient {
    config: Arc<LinkConfig>,
    session: Arc<SessionStore>,
    broadcaster: Arc<LogoutBroadcaster>,
    auth_guard: Arc<AuthFailureCoordinator>,
    aggregator: NotificationAggregator,
    connection: ConnectionHandle,
    _teardown: LogoutRegistration,
}

impl HeraldClient {
    /// Starts a builder with the WebSocket connector and no platform notifier.
    pub fn builder(config: LinkConfig) -> HeraldClientBuilder {
        HeraldClientBuilder {
            config,
            connector: Arc::new(WsConnector),
            notifier: Arc::new(NoOpNotifier),
        }
    }

    /// Creates a client with default components.
    pub fn new(config: LinkConfig) -> LinkResult<Self> {
        Self::builder(config).build()
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Signs in with a JWT bearer token and connects.
    pub async fn sign_in(&self, token: &str) -> LinkResult<()> {
        let session = Session::from_jwt(token)?;
        self.sign_in_session(session).await
    }

    /// Signs in with an already-built session and connects.
    ///
    /// A new identity resets the feed; any sign-in resets the auth error
    /// window. An already-expired session is refused without touching state.
    pub async fn sign_in_session(&self, session: Session) -> LinkResult<()> {
        session.ensure_valid_at(Utc::now())?;
        if self.session.identity().as_deref() != Some(session.identity.as_str()) {
            self.aggregator.reset();
        }
        self.auth_guard.reset_error_count();
        self.session.set(session.clone());
        self.connection.connect(session).await
    }

    /// Signs out: clears the session, disconnects, then runs every logout
    /// callback.
    pub async fn sign_out(&self) -> LinkResult<TriggerReport> {
        let identity = self.session.clear();
        self.connection.end_session().await?;
        let report = self.broadcaster.trigger_all();
        info!(identity = ?identity, invoked = report.invoked, "Signed out");
        Ok(report)
    }

    /// Current session, if signed in.
    pub fn session(&self) -> Option<Session> {
        self.session.current()
    }

    /// Watches identity changes.
    pub fn subscribe_identity(&self) -> watch::Receiver<Option<String>> {
        self.session.subscribe()
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects with the current session.
    pub async fn connect(&self) -> LinkResult<()> {
        let session = self.session.current().ok_or_else(|| {
            LinkError::auth(
                herald_core::AuthCategory::Unauthorized,
                "No session to connect with",
            )
        })?;
        self.connection.connect(session).await
    }

    pub async fn disconnect(&self) -> LinkResult<()> {
        self.connection.disconnect().await
    }

    pub async fn force_reconnect(&self) -> LinkResult<()> {
        self.connection.force_reconnect().await
    }

    /// Publishes a JSON payload. See [`ConnectionHandle::publish`].
    pub async fn publish(&self, payload: Value) -> LinkResult<()> {
        self.connection.publish(payload).await
    }

    pub async fn publish_to(&self, destination: &str, payload: &Value) -> LinkResult<()> {
        self.connection.publish_to(destination, payload).await
    }

    /// Publishes with linear backoff: waits `base_delay * attempt` between
    /// tries. Only retryable failures are retried.
    pub async fn publish_with_retry(
        &self,
        payload: Value,
        attempts: u32,
        base_delay: Duration,
    ) -> LinkResult<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connection.publish(payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = base_delay * attempt;
                    warn!(attempt, ?delay, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Registers a handler for `topic`; last registration per topic wins.
    pub fn add_handler<F>(&self, topic: impl Into<String>, handler: F) -> Disposer
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.connection.add_handler(topic, handler)
    }

    /// Stops the connection driver.
    pub async fn shutdown(&self) -> LinkResult<()> {
        debug!("Shutting down Herald client");
        self.connection.shutdown().await
    }

    // =========================================================================
    // Feed
    // =========================================================================

    pub fn reset_unread_count(&self) {
        self.aggregator.reset_unread_count();
    }

    pub fn mark_read(&self, id: &str) {
        self.aggregator.mark_read(id);
    }

    pub fn mark_all_read(&self) {
        self.aggregator.mark_all_read();
    }

    pub fn set_platform_notifications(&self, enabled: bool) {
        self.aggregator.set_platform_enabled(enabled);
    }

    pub fn feed(&self) -> NotificationFeed {
        self.aggregator.feed()
    }

    pub fn unread(&self) -> usize {
        self.aggregator.unread()
    }

    /// Watches committed feed changes.
    pub fn subscribe_feed(&self) -> watch::Receiver<NotificationFeed> {
        self.aggregator.subscribe()
    }

    // =========================================================================
    // Auth & Logout
    // =========================================================================

    /// Registers a callback run on every logout, in registration order.
    pub fn register_logout_callback<F>(&self, callback: F) -> LogoutRegistration
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.broadcaster.register(callback)
    }

    /// Installs the graceful logout tried before a forced logout.
    pub fn set_graceful_logout<F>(&self, callback: F)
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.auth_guard.set_graceful_logout(callback);
    }

    /// Reports an error seen anywhere in the host app.
    pub fn report_error(&self, error: &LinkError, force_logout: bool) -> AuthOutcome {
        self.auth_guard.handle(error, force_logout)
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn auth_guard(&self) -> &Arc<AuthFailureCoordinator> {
        &self.auth_guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{settle, MockConnector};
    use crate::transport::TransportEvent;
    use herald_core::AuthCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn client(connector: &MockConnector) -> HeraldClient {
        let mut config = LinkConfig::with_url("ws://broker.test/ws");
        config.reconnect.jitter = 0.0;
        HeraldClient::builder(config)
            .connector(Arc::new(connector.clone()))
            .build()
            .unwrap()
    }

    async fn connected(client: &HeraldClient) {
        let mut rx = client.subscribe_status();
        rx.wait_for(|s| s.state.is_connected()).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = LinkConfig::with_url("http://broker.test");
        assert!(matches!(
            HeraldClient::new(config),
            Err(LinkError::InvalidConfig(_)) | Err(LinkError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_session() {
        let connector = MockConnector::new();
        let client = client(&connector);

        let err = client.connect().await.unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_connects_and_receives() {
        let connector = MockConnector::new();
        let client = client(&connector);

        client
            .sign_in_session(Session::new("tok", "u-42"))
            .await
            .unwrap();
        connected(&client).await;
        assert_eq!(connector.last_request().unwrap().session.token, "tok");

        let mut feed = client.subscribe_feed();
        connector
            .emit(TransportEvent::Message(
                Frame::new(crate::protocol::Command::Message)
                    .header("destination", "/user/queue/notifications")
                    .with_body(r#"{"title":"A","content":"B","notificationType":"SYSTEM"}"#),
            ))
            .await;
        // The identity switch commits an empty feed first.
        feed.wait_for(|f| f.len() == 1).await.unwrap();
        assert_eq!(client.unread(), 1);

        client.reset_unread_count();
        client.aggregator.flush_now();
        assert_eq!(client.unread(), 0);
        assert_eq!(client.feed().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_refused() {
        let connector = MockConnector::new();
        let client = client(&connector);

        let session = Session::new("old", "u-1").with_expiry(Utc::now() - chrono::Duration::minutes(5));
        let err = client.sign_in_session(session).await.unwrap_err();
        assert_eq!(err.auth_category(), Some(AuthCategory::TokenExpired));

        settle().await;
        assert!(client.session().is_none());
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_switching_identity_resets_feed() {
        let connector = MockConnector::new();
        let client = client(&connector);

        client.sign_in_session(Session::new("t1", "alice")).await.unwrap();
        client
            .aggregator
            .ingest(r#"{"title":"A","content":"B","notificationType":"SYSTEM"}"#)
            .unwrap();
        client.aggregator.flush_now();
        assert_eq!(client.feed().len(), 1);

        // Same identity keeps the feed.
        client.sign_in_session(Session::new("t2", "alice")).await.unwrap();
        client.aggregator.flush_now();
        assert_eq!(client.feed().len(), 1);

        client.sign_in_session(Session::new("t3", "bob")).await.unwrap();
        client.aggregator.flush_now();
        assert!(client.feed().is_empty());
    }

    #[tokio::test]
    async fn test_forced_logout_tears_down_then_runs_callbacks() {
        let connector = MockConnector::new();
        let client = client(&connector);
        client.sign_in_session(Session::new("tok", "u-1")).await.unwrap();
        connected(&client).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let store = client.session.clone();
        let o = order.clone();
        let _first = client.register_logout_callback(move || {
            // Session is already cleared when callbacks run.
            o.lock().unwrap().push(("first", store.is_signed_in()));
            Ok(())
        });
        let o = order.clone();
        let _second = client.register_logout_callback(move || {
            o.lock().unwrap().push(("second", false));
            Err("boom".into())
        });
        let o = order.clone();
        let _third = client.register_logout_callback(move || {
            o.lock().unwrap().push(("third", false));
            Ok(())
        });

        let outcome = client.report_error(&LinkError::auth(AuthCategory::TokenExpired, "expired"), true);
        assert_eq!(outcome, AuthOutcome::ForcedLogout);
        assert!(client.session().is_none());
        assert_eq!(
            *order.lock().unwrap(),
            vec![("first", false), ("second", false), ("third", false)]
        );

        let mut rx = client.subscribe_status();
        rx.wait_for(|s| !s.state.is_live()).await.unwrap();
        settle().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_sign_out_runs_callbacks_once() {
        let connector = MockConnector::new();
        let client = client(&connector);
        client.sign_in_session(Session::new("tok", "u-1")).await.unwrap();
        connected(&client).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let registration = client.register_logout_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = client.sign_out().await.unwrap();
        assert_eq!(report.invoked, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.session().is_none());
        assert!(!client.is_connected());

        assert!(registration.unregister());
        client.sign_out().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_with_retry_stops_on_non_retryable() {
        let connector = MockConnector::new();
        let client = client(&connector);

        let err = client
            .publish_with_retry(serde_json::json!({"a": 1}), 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_retry_backs_off_linearly() {
        let connector = MockConnector::new();
        let client = client(&connector);
        client.sign_in_session(Session::new("tok", "u-1")).await.unwrap();
        connected(&client).await;

        connector.fail_writes(true);
        let started = tokio::time::Instant::now();
        let err = client
            .publish_with_retry(serde_json::json!({"a": 1}), 3, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::PublishFailed(_)));
        // 100ms + 200ms between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(300));

        connector.fail_writes(false);
        client
            .publish_with_retry(serde_json::json!({"a": 2}), 3, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_handler_survives_until_disconnect() {
        let connector = MockConnector::new();
        let client = client(&connector);
        client.sign_in_session(Session::new("tok", "u-1")).await.unwrap();
        connected(&client).await;

        let _disposer = client.add_handler("/topic/chat", |_| {});
        assert!(client.connection().registry().contains("/topic/chat"));

        client.disconnect().await.unwrap();
        assert!(client.connection().registry().is_empty());
        // The session survives a plain disconnect.
        assert!(client.session().is_some());
    }
}
