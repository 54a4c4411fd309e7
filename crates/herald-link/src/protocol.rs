//! # STOMP Frames
//!
//! STOMP 1.2 framing for the push channel, carried in WebSocket text messages.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STOMP over WebSocket                            │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT ───► CONNECT   { accept-version, host, heart-beat,             │
//! │                          Authorization: Bearer <token> }               │
//! │  BROKER ◄─── CONNECTED { version, heart-beat }                         │
//! │                                                                         │
//! │  SUBSCRIPTIONS                                                         │
//! │  ─────────────                                                         │
//! │  CLIENT ───► SUBSCRIBE { id, destination }                             │
//! │  BROKER ◄─── MESSAGE   { destination, subscription, message-id } body  │
//! │                                                                         │
//! │  PUBLISH                                                               │
//! │  ───────                                                               │
//! │  CLIENT ───► SEND      { destination, content-type, content-length }   │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  Both   ◄──► "\n" (heart-beat EOL between frames)                      │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  BROKER ◄─── ERROR     { message } body                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//! Header values escape `\\`, `\n`, `\r` and `:` except in `CONNECT` and
//! `CONNECTED`. When a `content-length` header is present the body is exactly
//! that many bytes; otherwise it runs to the first NUL.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{LinkError, LinkResult};

/// Protocol version offered on CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// Largest frame the decoder will buffer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Content type of JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// =============================================================================
// Commands
// =============================================================================

/// STOMP frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Header values of CONNECT and CONNECTED frames are not escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => {
                return Err(LinkError::InvalidFrame(format!(
                    "Unknown command: {}",
                    other
                )))
            }
        })
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A single STOMP frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of a header. A repeated header keeps its first value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// `destination` header.
    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }

    /// `subscription` header.
    pub fn subscription(&self) -> Option<&str> {
        self.get("subscription")
    }

    /// `message` header of an ERROR frame, falling back to the body.
    pub fn error_message(&self) -> String {
        match self.get("message") {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => self.body.trim().to_string(),
        }
    }

    // =========================================================================
    // Client Frames
    // =========================================================================

    /// CONNECT frame carrying the bearer token.
    pub fn connect(host: &str, authorization: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", heart_beat.to_string())
            .header("Authorization", authorization)
    }

    /// SUBSCRIBE frame.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// SEND frame with a JSON body.
    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", JSON_CONTENT_TYPE)
            .header("content-length", body.len().to_string())
            .with_body(body)
    }

    /// DISCONNECT frame.
    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Serializes the frame to its wire form, NUL terminator included.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');
        for (key, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses exactly one frame. Leading heart-beat EOLs are skipped.
    pub fn decode(input: &str) -> LinkResult<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder.buffer.extend_from_slice(input.as_bytes());

        let mut frame = None;
        while let Some(item) = decoder.next_item()? {
            if let Received::Frame(f) = item {
                if frame.replace(f).is_some() {
                    return Err(LinkError::InvalidFrame("Trailing data after frame".into()));
                }
            }
        }

        let frame = frame.ok_or_else(|| LinkError::InvalidFrame("Incomplete frame".into()))?;
        if decoder.has_pending() {
            return Err(LinkError::InvalidFrame(
                "Trailing data after frame".into(),
            ));
        }
        Ok(frame)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("authorization") {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("Frame")
            .field("command", &self.command)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> LinkResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(LinkError::InvalidFrame(format!(
                    "Undefined escape sequence: \\{}",
                    other
                )))
            }
            None => {
                return Err(LinkError::InvalidFrame(
                    "Dangling escape at end of header".into(),
                ))
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Streaming Decoder
// =============================================================================

/// Item produced by the [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A bare EOL between frames.
    Heartbeat,
    /// A complete frame.
    Frame(Frame),
}

/// Incremental decoder for one connection.
///
/// A WebSocket message may carry several frames, heart-beat EOLs, or only
/// part of a frame; incomplete input is buffered until the rest arrives.
/// A frame that fails to parse, or grows past [`MAX_FRAME_BYTES`], is
/// dropped through its terminating NUL and decoding resumes after it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Skipping the unread tail of a rejected frame.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a partial frame is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.discarding
    }

    /// Appends input and returns everything that is now complete.
    ///
    /// Undecodable frames are logged and skipped; frames on either side of
    /// them are still returned.
    pub fn feed(&mut self, input: &str) -> Vec<Received> {
        self.buffer.extend_from_slice(input.as_bytes());

        let mut out = Vec::new();
        loop {
            match self.next_item() {
                Ok(Some(item)) => out.push(item),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Skipping undecodable frame"),
            }
        }
        out
    }

    /// Takes one heart-beat or frame off the front of the buffer.
    fn next_item(&mut self) -> LinkResult<Option<Received>> {
        if self.discarding {
            match self.buffer.iter().position(|&b| b == 0) {
                Some(nul) => {
                    self.buffer.drain(..=nul);
                    self.discarding = false;
                }
                None => {
                    self.buffer.clear();
                    return Ok(None);
                }
            }
        }

        // Heart-beats: EOLs outside a frame.
        if self.buffer.first() == Some(&b'\n') {
            self.buffer.drain(..1);
            return Ok(Some(Received::Heartbeat));
        }
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
            return Ok(Some(Received::Heartbeat));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match parse_frame(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                self.buffer.drain(..consumed);
                Ok(Some(Received::Frame(frame)))
            }
            Ok(None) if self.buffer.len() > MAX_FRAME_BYTES => {
                self.reject();
                Err(LinkError::InvalidFrame(format!(
                    "Frame exceeds {} bytes",
                    MAX_FRAME_BYTES
                )))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.reject();
                Err(e)
            }
        }
    }

    /// Drops the frame at the front of the buffer through its NUL.
    fn reject(&mut self) {
        match self.buffer.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.buffer.drain(..=nul);
            }
            None => {
                self.buffer.clear();
                self.discarding = true;
            }
        }
    }
}

/// Reads one line (without its EOL) starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rel = buf[start..].iter().position(|&b| b == b'\n')?;
    let end = start + rel;
    let line = &buf[start..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, end + 1))
}

fn utf8(bytes: &[u8]) -> LinkResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| LinkError::InvalidFrame(e.to_string()))
}

/// Parses one frame from the front of `buf`.
///
/// Returns `None` when more input is needed.
fn parse_frame(buf: &[u8]) -> LinkResult<Option<(Frame, usize)>> {
    let Some((line, mut pos)) = read_line(buf, 0) else {
        return Ok(None);
    };
    let command: Command = utf8(line)?.parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let Some((line, next)) = read_line(buf, pos) else {
            return Ok(None);
        };
        pos = next;
        if line.is_empty() {
            break;
        }

        let line = utf8(line)?;
        let (key, value) = line.split_once(':').ok_or_else(|| {
            LinkError::InvalidFrame(format!("Header without ':' separator: {}", line))
        })?;
        if escape {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| LinkError::InvalidFrame(format!("Bad content-length: {}", v)))
        })
        .transpose()?;

    let body_start = pos;
    let body_end = match content_length {
        Some(len) => {
            let end = body_start
                .checked_add(len)
                .filter(|&end| end <= MAX_FRAME_BYTES)
                .ok_or_else(|| {
                    LinkError::InvalidFrame(format!(
                        "content-length {} exceeds {} bytes",
                        len, MAX_FRAME_BYTES
                    ))
                })?;
            if buf.len() <= end {
                return Ok(None);
            }
            if buf[end] != 0 {
                return Err(LinkError::InvalidFrame(
                    "Body longer than content-length".into(),
                ));
            }
            end
        }
        None => match buf[body_start..].iter().position(|&b| b == 0) {
            Some(rel) => body_start + rel,
            None => return Ok(None),
        },
    };

    let body = utf8(&buf[body_start..body_end])?.to_string();
    Ok(Some((
        Frame {
            command,
            headers,
            body,
        },
        body_end + 1,
    )))
}

// =============================================================================
// Heart-beating
// =============================================================================

/// `heart-beat` header value: `<outgoing>,<incoming>` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Smallest interval at which this side can send heart-beats (0 = never).
    pub outgoing_ms: u64,
    /// Desired interval between heart-beats from the peer (0 = none).
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        HeartBeat {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Reads the `heart-beat` header of a frame; absent means `0,0`.
    pub fn from_frame(frame: &Frame) -> LinkResult<Self> {
        match frame.get("heart-beat") {
            Some(raw) => raw.parse(),
            None => Ok(HeartBeat::default()),
        }
    }

    /// Negotiates intervals with the broker's CONNECTED header.
    ///
    /// Each direction is the larger of the two sides, or disabled when either
    /// side is 0.
    pub fn negotiate(&self, broker: &HeartBeat) -> Negotiated {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(ours.max(theirs)))
            }
        };
        Negotiated {
            send_every: pick(self.outgoing_ms, broker.incoming_ms),
            expect_every: pick(self.incoming_ms, broker.outgoing_ms),
        }
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

impl FromStr for HeartBeat {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LinkError::InvalidFrame(format!("Bad heart-beat header: {}", s));
        let (out, inc) = s.split_once(',').ok_or_else(bad)?;
        Ok(HeartBeat {
            outgoing_ms: out.trim().parse().map_err(|_| bad())?,
            incoming_ms: inc.trim().parse().map_err(|_| bad())?,
        })
    }
}

/// Heart-beat intervals in effect for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// How often we must send an EOL.
    pub send_every: Option<Duration>,
    /// How often the broker promised to send one.
    pub expect_every: Option<Duration>,
}

impl Negotiated {
    /// Silence after which the link is considered dead.
    pub fn silence_limit(&self) -> Option<Duration> {
        self.expect_every.map(|d| d * 2)
    }
}
