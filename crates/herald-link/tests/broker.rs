//! End-to-end tests against a minimal STOMP broker served by axum.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use herald_core::Session;
use herald_link::protocol::{Command, FrameDecoder, Received};
use herald_link::{ConnectionState, DisconnectReason, HeraldClient, LinkConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// What the broker saw.
#[derive(Default)]
struct Seen {
    upgrade_auth: Option<String>,
    connect_auth: Option<String>,
    subscriptions: Vec<String>,
    sends: Vec<(String, String)>,
    connects: usize,
    beats: usize,
}

type Shared = Arc<Mutex<Seen>>;

async fn start_broker() -> (SocketAddr, Shared) {
    let seen = Shared::default();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/silent", get(silent_handler))
        .route("/denied", get(|| async { StatusCode::UNAUTHORIZED }))
        .with_state(seen.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (addr, seen)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(seen): State<Shared>,
) -> impl IntoResponse {
    seen.lock().unwrap().upgrade_auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| serve_stomp(socket, seen))
}

async fn serve_stomp(socket: WebSocket, seen: Shared) {
    let (mut tx, mut rx) = socket.split();
    let mut decoder = FrameDecoder::new();

    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        for item in decoder.feed(text.as_str()) {
            let Received::Frame(frame) = item else {
                continue;
            };
            let reply = match frame.command {
                Command::Connect | Command::Stomp => {
                    seen.lock().unwrap().connect_auth =
                        frame.get("Authorization").map(str::to_string);
                    Some("CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0".to_string())
                }
                Command::Subscribe => {
                    let destination = frame.destination().unwrap_or_default().to_string();
                    let id = frame.get("id").unwrap_or_default().to_string();
                    seen.lock().unwrap().subscriptions.push(destination.clone());
                    let body = r#"{"title":"A","content":"B","notificationType":"SYSTEM"}"#;
                    Some(format!(
                        "MESSAGE\ndestination:{}\nsubscription:{}\nmessage-id:m-1\ncontent-length:{}\n\n{}\0",
                        destination,
                        id,
                        body.len(),
                        body
                    ))
                }
                Command::Send => {
                    seen.lock().unwrap().sends.push((
                        frame.destination().unwrap_or_default().to_string(),
                        frame.body.clone(),
                    ));
                    None
                }
                Command::Disconnect => return,
                _ => None,
            };
            if let Some(reply) = reply {
                if tx.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn silent_handler(ws: WebSocketUpgrade, State(seen): State<Shared>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_silent(socket, seen))
}

/// Negotiates 100ms heart-beats both ways, then never writes again.
async fn serve_silent(socket: WebSocket, seen: Shared) {
    let (mut tx, mut rx) = socket.split();
    let mut decoder = FrameDecoder::new();

    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        for item in decoder.feed(text.as_str()) {
            match item {
                Received::Heartbeat => seen.lock().unwrap().beats += 1,
                Received::Frame(frame) if frame.command == Command::Connect => {
                    seen.lock().unwrap().connects += 1;
                    let reply = "CONNECTED\nversion:1.2\nheart-beat:100,100\n\n\0";
                    if tx.send(Message::Text(reply.into())).await.is_err() {
                        return;
                    }
                }
                Received::Frame(_) => {}
            }
        }
    }
}

fn client_for(url: String) -> HeraldClient {
    let mut config = LinkConfig::with_url(url);
    config.reconnect.jitter = 0.0;
    HeraldClient::new(config).unwrap()
}

#[tokio::test]
async fn test_notification_reaches_feed() {
    let (addr, seen) = start_broker().await;
    let client = client_for(format!("ws://{}/ws", addr));
    let mut feed = client.subscribe_feed();

    client
        .sign_in_session(Session::new("secret-token", "u-7"))
        .await
        .unwrap();

    timeout(WAIT, feed.wait_for(|f| f.len() == 1))
        .await
        .expect("notification not delivered")
        .unwrap();

    let committed = client.feed();
    assert_eq!(committed.unread(), 1);
    assert_eq!(committed.items()[0].title, "A");
    assert_eq!(committed.items()[0].body, "B");
    assert_eq!(committed.items()[0].category, "SYSTEM");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.upgrade_auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(seen.connect_auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(seen.subscriptions, vec!["/user/queue/notifications".to_string()]);
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let (addr, seen) = start_broker().await;
    let client = client_for(format!("ws://{}/ws", addr));
    client
        .sign_in_session(Session::new("secret-token", "u-7"))
        .await
        .unwrap();

    let mut status = client.subscribe_status();
    timeout(WAIT, status.wait_for(|s| s.state.is_connected()))
        .await
        .expect("never connected")
        .unwrap();

    client
        .publish(json!({"destination": "/app/chat", "text": "hello"}))
        .await
        .unwrap();

    timeout(WAIT, async {
        loop {
            if !seen.lock().unwrap().sends.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("SEND not received");

    let sends = seen.lock().unwrap().sends.clone();
    assert_eq!(sends[0].0, "/app/chat");
    assert_eq!(sends[0].1, r#"{"text":"hello"}"#);

    client.disconnect().await.unwrap();
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
}

#[tokio::test]
async fn test_rejected_upgrade_logs_out() {
    let (addr, _seen) = start_broker().await;
    let client = client_for(format!("ws://{}/denied", addr));

    client
        .sign_in_session(Session::new("stale-token", "u-7"))
        .await
        .unwrap();
    let mut identity = client.subscribe_identity();

    // No graceful logout installed, so the first 401 forces a logout.
    timeout(WAIT, identity.wait_for(|id| id.is_none()))
        .await
        .expect("session not cleared")
        .unwrap();

    let mut status = client.subscribe_status();
    timeout(WAIT, status.wait_for(|s| !s.state.is_live()))
        .await
        .unwrap()
        .unwrap();
    assert!(client.session().is_none());
    assert_eq!(client.status().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_silent_broker_times_out_and_reconnects() {
    let (addr, seen) = start_broker().await;
    let mut config = LinkConfig::with_url(format!("ws://{}/silent", addr));
    config.heartbeat.outgoing_ms = 100;
    config.heartbeat.incoming_ms = 100;
    config.reconnect.delay_ms = 100;
    config.reconnect.jitter = 0.0;
    let client = HeraldClient::new(config).unwrap();
    let mut status = client.subscribe_status();

    client
        .sign_in_session(Session::new("secret-token", "u-7"))
        .await
        .unwrap();

    timeout(
        WAIT,
        status.wait_for(|s| {
            s.state == ConnectionState::Disconnected(DisconnectReason::HeartbeatTimeout)
        }),
    )
    .await
    .expect("silence never detected")
    .unwrap();
    assert!(status.borrow().last_error.is_some());

    timeout(WAIT, status.wait_for(|s| s.state.is_live()))
        .await
        .expect("no reconnect after heart-beat timeout")
        .unwrap();

    timeout(WAIT, async {
        loop {
            if seen.lock().unwrap().connects >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broker never saw a second CONNECT");

    // 100ms beats over a 200ms silence window.
    assert!(seen.lock().unwrap().beats >= 1);

    client.shutdown().await.unwrap();
}
