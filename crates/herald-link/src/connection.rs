//! # Connection Manager
//!
//! Owns the transport link for one session: connect, disconnect, reconnect,
//! publish and subscription replay.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Connection States                                 │
//! │                                                                         │
//! │  ┌──────┐  Open   ┌────────────┐ Handshake ┌───────────┐               │
//! │  │ Idle │───────► │ Connecting │─────────► │ Connected │               │
//! │  └──────┘         └─────┬──────┘           └─────┬─────┘               │
//! │      ▲                  │ Fault                  │ Fault                │
//! │      │                  ▼                        ▼                      │
//! │      │            ┌──────────┐   Close     ┌──────────────────────┐    │
//! │      │            │ Erroring │──────────►  │ Disconnected(reason) │    │
//! │      │            └──────────┘             └──────────┬───────────┘    │
//! │      │                                                │ Open            │
//! │      │     Teardown  ┌───────────────┐  Close(Requested)               │
//! │   (any) ───────────► │ Disconnecting │ ────────► Disconnected          │
//! │                      └───────────────┘                                 │
//! │                                                                         │
//! │  Open while Connecting/Connected is rejected (idempotent connect).     │
//! │                                                                         │
//! │  RECONNECT (abnormal close, session present, manager active)           │
//! │  ─────────────────────────────────────────────────────────────          │
//! │  Attempt 1: delay_ms (5s)   Attempt 2: 10s   Attempt 3: 20s ... 60s    │
//! │  At most one timer pending. Reset after a successful handshake.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//! [`ConnectionManager::spawn`] starts a single driver task. It alone owns the
//! link, the state and the timers; host calls reach it as commands through a
//! cloneable [`ConnectionHandle`]. Link events and open results carry the
//! generation of the link that produced them; anything from a superseded
//! generation is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use herald_core::Session;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::aggregator::NotificationAggregator;
use crate::auth_guard::AuthFailureCoordinator;
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::protocol::{Frame, HeartBeat};
use crate::registry::{Disposer, SubscriptionId, SubscriptionRegistry};
use crate::transport::{Connector, OpenRequest, Outgoing, TransportEvent, TransportLink, NORMAL_CLOSURE};

/// Command channel capacity.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Connection State
// =============================================================================

/// Why the connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` or teardown by the host.
    Requested,
    /// The broker closed with code 1000.
    Normal,
    /// Any other close code, or no close frame at all.
    Abnormal { code: Option<u16> },
    /// The broker went silent past the heart-beat window.
    HeartbeatTimeout,
}

impl DisconnectReason {
    /// Returns true if this closure should schedule a reconnect.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Abnormal { .. } | DisconnectReason::HeartbeatTimeout
        )
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected(DisconnectReason),
    Erroring,
}

/// Input to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new link is being opened.
    Open,
    /// The STOMP handshake completed.
    Handshake,
    /// Transport or protocol failure.
    Fault,
    /// The link closed.
    Close(DisconnectReason),
    /// Host-requested teardown.
    Teardown,
}

impl ConnectionState {
    /// Next state for `event`, or `None` if the transition is not allowed.
    pub fn on(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (*self, event) {
            (S::Connecting | S::Connected, E::Open) => None,
            (_, E::Open) => Some(S::Connecting),

            (S::Connecting, E::Handshake) => Some(S::Connected),
            (_, E::Handshake) => None,

            (S::Connecting | S::Connected | S::Erroring, E::Fault) => Some(S::Erroring),
            (_, E::Fault) => None,

            (S::Connecting | S::Connected | S::Erroring | S::Disconnecting, E::Close(reason)) => {
                Some(S::Disconnected(reason))
            }
            (_, E::Close(_)) => None,

            (S::Disconnecting, E::Teardown) => None,
            (_, E::Teardown) => Some(S::Disconnecting),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or Connected.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected(DisconnectReason::Requested) => {
                write!(f, "disconnected")
            }
            ConnectionState::Disconnected(DisconnectReason::Normal) => {
                write!(f, "disconnected (normal)")
            }
            ConnectionState::Disconnected(DisconnectReason::Abnormal { code: Some(c) }) => {
                write!(f, "disconnected (abnormal, code {})", c)
            }
            ConnectionState::Disconnected(DisconnectReason::Abnormal { code: None }) => {
                write!(f, "disconnected (abnormal)")
            }
            ConnectionState::Disconnected(DisconnectReason::HeartbeatTimeout) => {
                write!(f, "disconnected (heart-beat timeout)")
            }
            ConnectionState::Erroring => write!(f, "erroring"),
        }
    }
}

/// Observable connection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
}

// =============================================================================
// Commands
// =============================================================================

enum Command {
    Connect {
        session: Session,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        forget_session: bool,
        reply: Option<oneshot::Sender<()>>,
    },
    ForceReconnect {
        reply: oneshot::Sender<()>,
    },
    Publish {
        destination: String,
        body: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Subscribe {
        topic: String,
        id: SubscriptionId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Connection Handle
// =============================================================================

/// Host-side handle to the connection driver. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    registry: Arc<SubscriptionRegistry>,
    outbound: String,
}

impl ConnectionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> LinkResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| LinkError::ShuttingDown)?;
        rx.await
            .map_err(|_| LinkError::ChannelError("Driver dropped reply".into()))
    }

    /// Opens the connection for `session`. No-op while Connecting or Connected.
    pub async fn connect(&self, session: Session) -> LinkResult<()> {
        self.request(|reply| Command::Connect { session, reply }).await
    }

    /// Tears the connection down and clears all handlers.
    ///
    /// When this resolves the state is `Disconnected`.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.request(|reply| Command::Disconnect {
            forget_session: false,
            reply: Some(reply),
        })
        .await
    }

    /// Like [`disconnect`](Self::disconnect), and forgets the session so no
    /// reconnect can use its token.
    pub async fn end_session(&self) -> LinkResult<()> {
        self.request(|reply| Command::Disconnect {
            forget_session: true,
            reply: Some(reply),
        })
        .await
    }

    /// Non-blocking [`end_session`](Self::end_session) for synchronous callers.
    pub fn request_end_session(&self) -> LinkResult<()> {
        self.commands
            .try_send(Command::Disconnect {
                forget_session: true,
                reply: None,
            })
            .map_err(|_| LinkError::ChannelError("Failed to queue disconnect".into()))
    }

    /// Tears down, waits the settle delay, then reconnects with the current
    /// session. Resolves once the teardown is done.
    pub async fn force_reconnect(&self) -> LinkResult<()> {
        self.request(|reply| Command::ForceReconnect { reply }).await
    }

    /// Publishes a JSON payload.
    ///
    /// A string `destination` field is removed from the body and used as the
    /// destination; otherwise the configured outbound topic is used.
    pub async fn publish(&self, payload: Value) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let (destination, body) = split_destination(payload, &self.outbound)?;
        self.send_publish(destination, body).await
    }

    /// Publishes a JSON payload to an explicit destination.
    pub async fn publish_to(&self, destination: &str, payload: &Value) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let body = serde_json::to_string(payload)?;
        self.send_publish(destination.to_string(), body).await
    }

    async fn send_publish(&self, destination: String, body: String) -> LinkResult<()> {
        self.request(|reply| Command::Publish {
            destination,
            body,
            reply,
        })
        .await?
    }

    /// Registers a handler for `topic` (last write wins) and subscribes at
    /// the broker if already connected.
    pub fn add_handler<F>(&self, topic: impl Into<String>, handler: F) -> Disposer
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let disposer = self.registry.add_handler(topic.clone(), handler);
        if let Err(e) = self.commands.try_send(Command::Subscribe {
            topic,
            id: disposer.id(),
        }) {
            warn!(error = %e, "Failed to queue subscribe");
        }
        disposer
    }

    /// Stops the driver after a full teardown.
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    /// Watches connection status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("status", &self.status())
            .finish()
    }
}

/// Splits the optional `destination` field off a payload.
fn split_destination(payload: Value, default: &str) -> LinkResult<(String, String)> {
    let mut payload = payload;
    let destination = match payload.as_object_mut() {
        Some(map) if map.get("destination").map_or(false, Value::is_string) => {
            match map.remove("destination") {
                Some(Value::String(d)) => d,
                _ => default.to_string(),
            }
        }
        _ => default.to_string(),
    };
    let body = serde_json::to_string(&payload)?;
    Ok((destination, body))
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Builder for the connection driver.
pub struct ConnectionManager {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    aggregator: NotificationAggregator,
    auth_guard: Option<Arc<AuthFailureCoordinator>>,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            config,
            connector,
            registry: SubscriptionRegistry::new(),
            aggregator: NotificationAggregator::default(),
            auth_guard: None,
        }
    }

    /// Uses a shared registry.
    pub fn with_registry(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Feed sink attached to the default topic on every handshake.
    pub fn with_aggregator(mut self, aggregator: NotificationAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Receives authentication-class open failures.
    pub fn with_auth_guard(mut self, guard: Arc<AuthFailureCoordinator>) -> Self {
        self.auth_guard = Some(guard);
        self
    }

    /// Starts the driver task.
    pub fn spawn(self) -> ConnectionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();

        let handle = ConnectionHandle {
            commands: commands_tx,
            status: status_rx,
            registry: self.registry.clone(),
            outbound: self.config.outbound_topic().to_string(),
        };

        let backoff = reconnect_backoff(&self.config);
        let driver = Driver {
            config: self.config,
            connector: self.connector,
            registry: self.registry,
            aggregator: self.aggregator,
            auth_guard: self.auth_guard,
            commands: commands_rx,
            status_tx,
            opened_tx,
            opened_rx,
            state: ConnectionState::Idle,
            last_error: None,
            session: None,
            generation: 0,
            link: None,
            broker_subscriptions: HashMap::new(),
            reconnect_at: None,
            settle_at: None,
            backoff,
            attempts: 0,
        };
        tokio::spawn(driver.run());

        handle
    }
}

/// Reconnect delays: `delay_ms`, doubling up to `max_delay_secs`.
fn reconnect_backoff(config: &LinkConfig) -> ExponentialBackoff {
    let initial = config.reconnect_delay();
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: config.reconnect.jitter,
        multiplier: 2.0,
        max_interval: Duration::from_secs(config.reconnect.max_delay_secs).max(initial),
        max_elapsed_time: None,
        ..Default::default()
    }
}

// =============================================================================
// Driver
// =============================================================================

struct ActiveLink {
    generation: u64,
    link: TransportLink,
}

type OpenResult = (u64, LinkResult<TransportLink>);

struct Driver {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    aggregator: NotificationAggregator,
    auth_guard: Option<Arc<AuthFailureCoordinator>>,

    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    opened_tx: mpsc::UnboundedSender<OpenResult>,
    opened_rx: mpsc::UnboundedReceiver<OpenResult>,

    state: ConnectionState,
    last_error: Option<String>,
    session: Option<Session>,
    generation: u64,
    link: Option<ActiveLink>,
    /// Topics subscribed at the broker on the current link.
    broker_subscriptions: HashMap<String, SubscriptionId>,

    reconnect_at: Option<Instant>,
    settle_at: Option<Instant>,
    backoff: ExponentialBackoff,
    attempts: u32,
}

/// Next event of the current link; pending forever when there is none.
async fn next_link_event(link: &mut Option<ActiveLink>) -> (u64, TransportEvent) {
    match link {
        Some(active) => {
            let event = active
                .link
                .next_event()
                .await
                .unwrap_or(TransportEvent::Closed { code: None });
            (active.generation, event)
        }
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        info!("Connection driver started");

        loop {
            let far = Instant::now() + Duration::from_secs(86_400);
            let reconnect_at = self.reconnect_at;
            let settle_at = self.settle_at;

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.teardown(true);
                            self.publish_status();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("All handles dropped");
                            self.teardown(true);
                            break;
                        }
                    }
                }

                Some((generation, result)) = self.opened_rx.recv() => {
                    self.on_opened(generation, result);
                }

                (generation, event) = next_link_event(&mut self.link) => {
                    self.on_link_event(generation, event);
                }

                _ = sleep_until(reconnect_at.unwrap_or(far)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.on_reconnect_timer();
                }

                _ = sleep_until(settle_at.unwrap_or(far)), if settle_at.is_some() => {
                    self.settle_at = None;
                    match self.session.clone() {
                        Some(session) => self.connect(session),
                        None => debug!("Session gone during settle delay"),
                    }
                }
            }

            self.publish_status();
        }

        self.publish_status();
        info!("Connection driver stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { session, reply } => {
                self.connect(session);
                self.publish_status();
                let _ = reply.send(());
            }
            Command::Disconnect {
                forget_session,
                reply,
            } => {
                self.teardown(forget_session);
                self.publish_status();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::ForceReconnect { reply } => {
                info!("Forcing reconnect");
                self.teardown(false);
                if self.session.is_some() {
                    self.settle_at = Some(Instant::now() + self.config.settle_delay());
                }
                self.publish_status();
                let _ = reply.send(());
            }
            Command::Publish {
                destination,
                body,
                reply,
            } => self.publish(destination, body, reply),
            Command::Subscribe { topic, id } => self.subscribe(topic, id),
            Command::Shutdown { .. } => {}
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    fn transition(&mut self, event: ConnectionEvent) {
        match self.state.on(event) {
            Some(next) => {
                if next != self.state {
                    debug!(from = %self.state, to = %next, "Connection state transition");
                }
                self.state = next;
            }
            None => debug!(state = %self.state, ?event, "Transition not allowed, ignoring"),
        }
    }

    fn publish_status(&self) {
        let status = ConnectionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.attempts,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    // =========================================================================
    // Connect / Teardown
    // =========================================================================

    fn connect(&mut self, session: Session) {
        self.session = Some(session.clone());
        if self.state.is_live() {
            debug!(state = %self.state, "Already connecting or connected");
            return;
        }

        let Some(url) = self.config.broker_url().map(str::to_string) else {
            self.last_error = Some(LinkError::InvalidConfig("No broker URL configured".into()).to_string());
            warn!("Cannot connect without a broker URL");
            return;
        };

        self.reconnect_at = None;
        self.settle_at = None;
        self.release_link();
        self.generation += 1;
        self.transition(ConnectionEvent::Open);

        let request = OpenRequest {
            url,
            session,
            heart_beat: HeartBeat::new(self.config.heartbeat.outgoing_ms, self.config.heartbeat.incoming_ms),
            connect_timeout: self.config.connect_timeout(),
        };

        info!(url = %request.url, generation = self.generation, "Connecting");
        let connector = self.connector.clone();
        let opened = self.opened_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = connector.open(request).await;
            let _ = opened.send((generation, result));
        });
    }

    /// Drops the current link; its task closes the socket.
    fn release_link(&mut self) {
        if let Some(active) = self.link.take() {
            debug!(generation = active.generation, "Releasing link");
        }
        self.broker_subscriptions.clear();
    }

    fn teardown(&mut self, forget_session: bool) {
        if self.reconnect_at.take().is_some() {
            debug!("Pending reconnect cancelled");
        }
        self.settle_at = None;
        self.registry.clear();
        self.release_link();
        // Invalidates opens still in flight.
        self.generation += 1;
        if forget_session {
            self.session = None;
        }

        self.transition(ConnectionEvent::Teardown);
        self.transition(ConnectionEvent::Close(DisconnectReason::Requested));
        self.last_error = None;
        self.backoff.reset();
        self.attempts = 0;
        info!("Disconnected");
    }

    // =========================================================================
    // Link Events
    // =========================================================================

    fn on_opened(&mut self, generation: u64, result: LinkResult<TransportLink>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, current = self.generation, "Dropping stale open result");
            return;
        }

        match result {
            Ok(link) => {
                debug!(generation, "Link open, awaiting handshake");
                self.link = Some(ActiveLink { generation, link });
            }
            Err(err) => {
                error!(error = %err, "Failed to open link");
                self.last_error = Some(err.to_string());
                self.transition(ConnectionEvent::Fault);
                self.transition(ConnectionEvent::Close(DisconnectReason::Abnormal {
                    code: err.http_status(),
                }));

                if err.is_authentication() {
                    warn!(category = ?err.auth_category(), "Broker rejected credentials");
                    if let Some(guard) = &self.auth_guard {
                        let outcome = guard.handle(&err, false);
                        debug!(?outcome, "Auth failure reported");
                    }
                } else {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn on_link_event(&mut self, generation: u64, event: TransportEvent) {
        if self.link.as_ref().map(|l| l.generation) != Some(generation) {
            debug!(generation, event = event.type_name(), "Dropping event from stale link");
            return;
        }

        match event {
            TransportEvent::Connected { heart_beat, version } => {
                info!(?version, ?heart_beat, "Connected to broker");
                self.transition(ConnectionEvent::Handshake);
                if !self.state.is_connected() {
                    return;
                }
                self.last_error = None;
                self.backoff.reset();
                self.attempts = 0;
                self.attach_default_handler();
                self.subscribe_all();
            }
            TransportEvent::Message(frame) => {
                self.registry.dispatch(&frame);
            }
            TransportEvent::ProtocolError(err) | TransportEvent::TransportError(err) => {
                warn!(error = %err, "Link fault");
                self.last_error = Some(err.to_string());
                self.transition(ConnectionEvent::Fault);
            }
            TransportEvent::HeartbeatTimeout(limit) => {
                self.last_error = Some(LinkError::HeartbeatTimeout(limit.as_millis() as u64).to_string());
                self.on_closed(DisconnectReason::HeartbeatTimeout);
            }
            TransportEvent::Closed { code } => {
                let reason = if code == Some(NORMAL_CLOSURE) {
                    DisconnectReason::Normal
                } else {
                    DisconnectReason::Abnormal { code }
                };
                self.on_closed(reason);
            }
        }
    }

    fn on_closed(&mut self, reason: DisconnectReason) {
        info!(?reason, "Link closed");
        self.release_link();
        self.transition(ConnectionEvent::Close(reason));

        if reason.is_abnormal() {
            self.schedule_reconnect();
        }
    }

    // =========================================================================
    // Reconnect
    // =========================================================================

    fn schedule_reconnect(&mut self) {
        if self.session.is_none() {
            debug!("No session, not reconnecting");
            return;
        }
        if self.reconnect_at.is_some() {
            debug!("Reconnect already pending");
            return;
        }

        let max = self.config.reconnect.max_attempts;
        if max > 0 && self.attempts >= max {
            error!(max_attempts = max, "Max reconnection attempts reached");
            return;
        }

        match self.backoff.next_backoff() {
            Some(delay) => {
                self.attempts += 1;
                info!(?delay, attempt = self.attempts, "Scheduling reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => error!("Backoff exhausted"),
        }
    }

    fn on_reconnect_timer(&mut self) {
        match self.session.clone() {
            Some(session) => {
                debug!(attempt = self.attempts, "Reconnect timer fired");
                self.connect(session);
            }
            None => debug!("Session gone before reconnect"),
        }
    }

    // =========================================================================
    // Subscriptions & Publish
    // =========================================================================

    fn attach_default_handler(&mut self) {
        let Some(identity) = self.session.as_ref().map(|s| s.identity.clone()) else {
            return;
        };
        let topic = self.config.inbound_topic(&identity);
        self.registry
            .add_handler(topic.clone(), self.aggregator.frame_handler());
        debug!(topic = %topic, "Default handler attached");
    }

    fn subscribe_all(&mut self) {
        for (topic, id) in self.registry.subscriptions() {
            self.subscribe(topic, id);
        }
    }

    fn subscribe(&mut self, topic: String, id: SubscriptionId) {
        if !self.state.is_connected() {
            return;
        }
        let Some(active) = &self.link else {
            return;
        };
        if self.broker_subscriptions.contains_key(&topic) {
            // Delivery is keyed by destination, so the broker subscription
            // stays valid for the replacing handler.
            self.broker_subscriptions.insert(topic, id);
            return;
        }

        debug!(topic = %topic, id = %id, "Subscribing");
        let frame = Frame::subscribe(&id.to_string(), &topic);
        match active.link.enqueue(Outgoing::new(frame)) {
            Ok(()) => {
                self.broker_subscriptions.insert(topic, id);
            }
            Err(e) => warn!(topic = %topic, error = %e, "Failed to subscribe"),
        }
    }

    fn publish(
        &mut self,
        destination: String,
        body: String,
        reply: oneshot::Sender<LinkResult<()>>,
    ) {
        let active = match (&self.link, self.state) {
            (Some(active), ConnectionState::Connected) => active,
            _ => {
                let _ = reply.send(Err(LinkError::NotConnected));
                return;
            }
        };

        debug!(destination = %destination, len = body.len(), "Publishing");
        let frame = Frame::send_json(&destination, body);
        // Failure is delivered through the acknowledgement.
        let _ = active.link.enqueue(Outgoing::with_ack(frame, reply));
    }
}
