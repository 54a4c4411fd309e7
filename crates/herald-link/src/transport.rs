//! # WebSocket Transport
//!
//! One STOMP session over one WebSocket. A [`Connector`] opens a
//! [`TransportLink`]; the link's background task owns the socket, writes
//! queued frames, decodes inbound frames and keeps heart-beats flowing.
//! Reconnection is not done here; the connection manager decides when to
//! open a new link.
//!
//! ## Link Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Transport Link                                  │
//! │                                                                         │
//! │  open(request)                                                         │
//! │     │  WS upgrade + Authorization: Bearer <token>                      │
//! │     │  (HTTP 401/403 ──► Err(LinkError::Http))                         │
//! │     ▼                                                                   │
//! │  CONNECT ──► CONNECTED ──► TransportEvent::Connected { heart_beat }    │
//! │     │                                                                   │
//! │     ├── MESSAGE ──────────► TransportEvent::Message(frame)             │
//! │     ├── ERROR ────────────► TransportEvent::ProtocolError(err)         │
//! │     ├── socket error ─────► TransportEvent::TransportError(err)        │
//! │     ├── silence > 2×hb ───► TransportEvent::HeartbeatTimeout           │
//! │     └── close frame ──────► TransportEvent::Closed { code }            │
//! │                                                                         │
//! │  Dropping the link (or close()) sends DISCONNECT + close 1000.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use herald_core::Session;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::error::{LinkError, LinkResult};
use crate::protocol::{Command, Frame, FrameDecoder, HeartBeat, Negotiated, Received};

/// Close code of an intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Capacity of the per-link channels.
const LINK_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// =============================================================================
// Events & Frames
// =============================================================================

/// Something that happened on a link.
#[derive(Debug)]
pub enum TransportEvent {
    /// STOMP handshake complete.
    Connected {
        heart_beat: Negotiated,
        version: Option<String>,
    },
    /// Inbound MESSAGE frame.
    Message(Frame),
    /// The broker sent an ERROR frame.
    ProtocolError(LinkError),
    /// The socket failed.
    TransportError(LinkError),
    /// No data from the broker within the negotiated window.
    HeartbeatTimeout(Duration),
    /// The socket closed. `None` when no close frame was received.
    Closed { code: Option<u16> },
}

impl TransportEvent {
    /// Short name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::Message(_) => "message",
            TransportEvent::ProtocolError(_) => "protocol_error",
            TransportEvent::TransportError(_) => "transport_error",
            TransportEvent::HeartbeatTimeout(_) => "heartbeat_timeout",
            TransportEvent::Closed { .. } => "closed",
        }
    }
}

/// A frame queued for writing, with an optional write acknowledgement.
#[derive(Debug)]
pub struct Outgoing {
    pub frame: Frame,
    pub ack: Option<oneshot::Sender<LinkResult<()>>>,
}

impl Outgoing {
    pub fn new(frame: Frame) -> Self {
        Outgoing { frame, ack: None }
    }

    pub fn with_ack(frame: Frame, ack: oneshot::Sender<LinkResult<()>>) -> Self {
        Outgoing {
            frame,
            ack: Some(ack),
        }
    }
}

// =============================================================================
// Link
// =============================================================================

/// Everything needed to open one link.
#[derive(Clone)]
pub struct OpenRequest {
    pub url: String,
    pub session: Session,
    pub heart_beat: HeartBeat,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRequest")
            .field("url", &self.url)
            .field("session", &self.session)
            .field("heart_beat", &self.heart_beat)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// An open link: frames go out through `outgoing`, events come back on
/// `events`. The link's task stops when this value is dropped.
#[derive(Debug)]
pub struct TransportLink {
    outgoing: mpsc::Sender<Outgoing>,
    events: mpsc::Receiver<TransportEvent>,
}

impl TransportLink {
    /// Builds a link from its two channel ends.
    pub fn new(outgoing: mpsc::Sender<Outgoing>, events: mpsc::Receiver<TransportEvent>) -> Self {
        TransportLink { outgoing, events }
    }

    /// Creates both channel pairs; the second value is the task side.
    pub fn channel() -> (Self, LinkTaskEnds) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (ev_tx, ev_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (
            TransportLink::new(out_tx, ev_rx),
            LinkTaskEnds {
                outgoing: out_rx,
                events: ev_tx,
            },
        )
    }

    /// Queues a frame without waiting for the write.
    ///
    /// On failure the acknowledgement, if any, receives the same error.
    pub fn enqueue(&self, outgoing: Outgoing) -> LinkResult<()> {
        let (reason, rejected) = match self.outgoing.try_send(outgoing) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(o)) => ("outgoing queue full", o),
            Err(mpsc::error::TrySendError::Closed(o)) => ("link closed", o),
        };
        let err = LinkError::PublishFailed(reason.into());
        if let Some(ack) = rejected.ack {
            let _ = ack.send(Err(err.clone()));
        }
        Err(err)
    }

    /// Next event, or `None` once the link task has stopped.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Task-side ends of a [`TransportLink`].
#[derive(Debug)]
pub struct LinkTaskEnds {
    pub outgoing: mpsc::Receiver<Outgoing>,
    pub events: mpsc::Sender<TransportEvent>,
}

// =============================================================================
// Connector
// =============================================================================

/// Opens links to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a link. Fails if the socket cannot be established.
    async fn open(&self, request: OpenRequest) -> LinkResult<TransportLink>;
}

/// Connector for STOMP over `ws://` / `wss://`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, request: OpenRequest) -> LinkResult<TransportLink> {
        let url = url::Url::parse(&request.url)?;
        let host = url.host_str().unwrap_or("localhost").to_string();

        let mut ws_request = request.url.as_str().into_client_request()?;
        let authorization = request.session.bearer();
        let bearer = HeaderValue::from_str(&authorization)
            .map_err(|_| LinkError::InvalidConfig("Token is not a valid header value".into()))?;
        ws_request.headers_mut().insert(AUTHORIZATION, bearer);

        info!(url = %request.url, "Opening WebSocket");
        let ws = match timeout(request.connect_timeout, connect_async(ws_request)).await {
            Ok(Ok((ws, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws
            }
            Ok(Err(e)) => return Err(LinkError::from(e)),
            Err(_) => return Err(LinkError::Timeout(request.connect_timeout.as_secs())),
        };

        let (link, ends) = TransportLink::channel();
        let connect = Frame::connect(&host, &authorization, request.heart_beat);
        tokio::spawn(run_link(
            ws,
            ends,
            connect,
            request.heart_beat,
            request.connect_timeout,
        ));
        Ok(link)
    }
}

// =============================================================================
// Link Task
// =============================================================================

/// How a link task ended.
enum Exit {
    /// Emit these events, then stop.
    Report(Vec<TransportEvent>),
    /// The owner dropped the link; close quietly.
    Abandoned,
}

async fn run_link(
    ws: WsStream,
    ends: LinkTaskEnds,
    connect: Frame,
    offered: HeartBeat,
    handshake_timeout: Duration,
) {
    let LinkTaskEnds {
        mut outgoing,
        events,
    } = ends;
    let (mut write, mut read) = ws.split();

    let exit = 'link: {
        if let Err(e) = write.send(WsMessage::Text(connect.encode().into())).await {
            break 'link Exit::Report(vec![
                TransportEvent::TransportError(LinkError::from(e)),
                TransportEvent::Closed { code: None },
            ]);
        }
        debug!("CONNECT sent");

        let mut decoder = FrameDecoder::new();
        let mut negotiated: Option<Negotiated> = None;
        let handshake_deadline = Instant::now() + handshake_timeout;
        let mut last_received = Instant::now();
        let mut next_beat = Instant::now();

        loop {
            let send_every = negotiated.and_then(|n| n.send_every);
            let silence_limit = negotiated.and_then(|n| n.silence_limit());
            let far = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                queued = outgoing.recv() => {
                    let Some(Outgoing { frame, ack }) = queued else {
                        break 'link Exit::Abandoned;
                    };
                    trace!(command = %frame.command, "Writing frame");
                    let result = write
                        .send(WsMessage::Text(frame.encode().into()))
                        .await
                        .map_err(|e| LinkError::PublishFailed(e.to_string()));
                    let failed = result.as_ref().err().cloned();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if let Some(err) = failed {
                        break 'link Exit::Report(vec![
                            TransportEvent::TransportError(err),
                            TransportEvent::Closed { code: None },
                        ]);
                    }
                    if let Some(every) = send_every {
                        next_beat = Instant::now() + every;
                    }
                }

                inbound = read.next() => {
                    last_received = Instant::now();
                    let text = match inbound {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            info!(?code, "Received close frame");
                            break 'link Exit::Report(vec![TransportEvent::Closed { code }]);
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                        Some(Ok(WsMessage::Binary(_))) => {
                            warn!("Received unexpected binary message");
                            continue;
                        }
                        Some(Ok(WsMessage::Frame(_))) => continue,
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break 'link Exit::Report(vec![
                                TransportEvent::TransportError(LinkError::from(e)),
                                TransportEvent::Closed { code: None },
                            ]);
                        }
                        None => {
                            break 'link Exit::Report(vec![TransportEvent::Closed { code: None }]);
                        }
                    };

                    for item in decoder.feed(&text) {
                        let frame = match item {
                            Received::Heartbeat => {
                                trace!("Heart-beat received");
                                continue;
                            }
                            Received::Frame(frame) => frame,
                        };

                        let event = match frame.command {
                            Command::Connected => {
                                let broker = HeartBeat::from_frame(&frame).unwrap_or_default();
                                let n = offered.negotiate(&broker);
                                debug!(?n, "STOMP session established");
                                negotiated = Some(n);
                                if let Some(every) = n.send_every {
                                    next_beat = Instant::now() + every;
                                }
                                TransportEvent::Connected {
                                    heart_beat: n,
                                    version: frame.get("version").map(str::to_string),
                                }
                            }
                            Command::Message => TransportEvent::Message(frame),
                            Command::Error => {
                                TransportEvent::ProtocolError(LinkError::Protocol(frame.error_message()))
                            }
                            Command::Receipt => {
                                debug!(receipt = ?frame.get("receipt-id"), "Receipt");
                                continue;
                            }
                            other => {
                                warn!(command = %other, "Unexpected frame from broker");
                                continue;
                            }
                        };

                        if events.send(event).await.is_err() {
                            break 'link Exit::Abandoned;
                        }
                    }
                }

                _ = sleep_until(next_beat), if send_every.is_some() => {
                    trace!("Sending heart-beat");
                    if let Err(e) = write.send(WsMessage::Text("\n".into())).await {
                        break 'link Exit::Report(vec![
                            TransportEvent::TransportError(LinkError::from(e)),
                            TransportEvent::Closed { code: None },
                        ]);
                    }
                    next_beat = Instant::now() + send_every.unwrap_or_default();
                }

                _ = sleep_until(silence_limit.map(|l| last_received + l).unwrap_or(far)), if silence_limit.is_some() => {
                    let limit = silence_limit.unwrap_or_default();
                    warn!(limit_ms = limit.as_millis() as u64, "Heart-beat timeout");
                    break 'link Exit::Report(vec![TransportEvent::HeartbeatTimeout(limit)]);
                }

                _ = sleep_until(handshake_deadline), if negotiated.is_none() => {
                    warn!("No CONNECTED frame before deadline");
                    break 'link Exit::Report(vec![
                        TransportEvent::TransportError(LinkError::Timeout(handshake_timeout.as_secs())),
                        TransportEvent::Closed { code: None },
                    ]);
                }
            }
        }
    };

    match exit {
        Exit::Report(final_events) => {
            let _ = write.send(WsMessage::Close(None)).await;
            for event in final_events {
                debug!(event = event.type_name(), "Link ending");
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
        Exit::Abandoned => {
            debug!("Link released, closing socket");
            let _ = write
                .send(WsMessage::Text(Frame::disconnect().encode().into()))
                .await;
            let _ = write
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("client disconnect"),
                })))
                .await;
        }
    }
}
