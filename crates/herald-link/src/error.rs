//! # Link Error Types
//!
//! Error types for the push channel.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Link Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Protocol (ERROR frame) │ │
//! │  │  InvalidUrl     │  │  Http (status)  │  │  InvalidFrame           │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Authentication  │  │    Payload      │  │      Publish            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Auth(category) │  │  Malformed      │  │  NotConnected           │ │
//! │  │  Http 401 / 403 │  │  Serialization  │  │  PublishFailed          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//! - Transport / protocol errors are recorded on the connection status and
//!   drive the state machine; they are not returned to host calls
//! - Malformed payloads are logged and dropped at the aggregator
//! - Authentication errors are routed to the `AuthFailureCoordinator`
//! - Publish errors are returned to the caller

use herald_core::{AuthCategory, CoreError};
use thiserror::Error;

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Broad category of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration.
    Config,
    /// Socket-level failure.
    Transport,
    /// Pub/sub protocol-level failure.
    Protocol,
    /// Expired, invalid or rejected credentials.
    Authentication,
    /// Inbound frame body could not be parsed.
    MalformedPayload,
    /// Send attempted while not connected, or the send failed.
    Publish,
    /// Channel or task failure inside the link.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Authentication => write!(f, "authentication"),
            ErrorKind::MalformedPayload => write!(f, "malformed_payload"),
            ErrorKind::Publish => write!(f, "publish"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Push channel error type.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid link configuration.
    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),

    /// Invalid broker URL.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The upgrade request was answered with a non-101 HTTP status.
    #[error("Broker answered HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Socket closed underneath us.
    #[error("Disconnected from broker")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// No heart-beat received within the negotiated window.
    #[error("Heart-beat timeout after {0} ms of silence")]
    HeartbeatTimeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket layer error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The broker sent a STOMP `ERROR` frame.
    #[error("Broker error: {0}")]
    Protocol(String),

    /// A frame could not be decoded.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Authentication failure with an explicit category.
    #[error("Authentication failed ({category}): {message}")]
    Auth {
        category: AuthCategory,
        message: String,
    },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Inbound frame body did not parse.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Outbound payload could not be serialized.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Publish Errors
    // =========================================================================
    /// Publish attempted while the connection is not established.
    #[error("Not connected")]
    NotConnected,

    /// The frame could not be written to the socket.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The connection driver has stopped.
    #[error("Connection manager is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LinkError {
    /// Creates an authentication error with an explicit category.
    pub fn auth(category: AuthCategory, message: impl Into<String>) -> Self {
        LinkError::Auth {
            category,
            message: message.into(),
        }
    }

    /// Creates an HTTP error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        LinkError::Http {
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            LinkError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Authentication category, if this error is authentication-class.
    ///
    /// ## Predicate Set
    /// - carries HTTP status 401 or 403
    /// - is tagged with an explicit [`AuthCategory`]
    pub fn auth_category(&self) -> Option<AuthCategory> {
        match self {
            LinkError::Auth { category, .. } => Some(*category),
            LinkError::Http { status, .. } => AuthCategory::from_http_status(*status),
            _ => None,
        }
    }

    /// Returns true if this error is authentication-class.
    pub fn is_authentication(&self) -> bool {
        self.auth_category().is_some()
    }

    /// Broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        if self.is_authentication() {
            return ErrorKind::Authentication;
        }
        match self {
            LinkError::InvalidConfig(_)
            | LinkError::InvalidUrl(_)
            | LinkError::ConfigLoadFailed(_)
            | LinkError::ConfigSaveFailed(_) => ErrorKind::Config,

            LinkError::ConnectionFailed(_)
            | LinkError::Http { .. }
            | LinkError::Disconnected
            | LinkError::Timeout(_)
            | LinkError::HeartbeatTimeout(_)
            | LinkError::TlsError(_)
            | LinkError::WebSocketError(_) => ErrorKind::Transport,

            LinkError::Protocol(_) | LinkError::InvalidFrame(_) => ErrorKind::Protocol,

            LinkError::Auth { .. } => ErrorKind::Authentication,

            LinkError::MalformedPayload(_) => ErrorKind::MalformedPayload,

            LinkError::SerializationFailed(_)
            | LinkError::NotConnected
            | LinkError::PublishFailed(_) => ErrorKind::Publish,

            LinkError::ChannelError(_) | LinkError::ShuttingDown | LinkError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures, timeouts, disconnections
    /// - Server-side HTTP failures (5xx)
    /// - Failed socket writes
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Authentication errors
    /// - Publishing while not connected
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::ConnectionFailed(_)
            | LinkError::Disconnected
            | LinkError::Timeout(_)
            | LinkError::HeartbeatTimeout(_)
            | LinkError::WebSocketError(_)
            | LinkError::PublishFailed(_) => true,
            LinkError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for LinkError {
    fn from(err: CoreError) -> Self {
        match err.auth_category() {
            Some(category) => LinkError::auth(category, err.to_string()),
            None => LinkError::MalformedPayload(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for LinkError {
    fn from(err: url::ParseError) -> Self {
        LinkError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => LinkError::Disconnected,
            WsError::AlreadyClosed => LinkError::Disconnected,
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let message = response
                    .body()
                    .as_ref()
                    .filter(|b| !b.is_empty())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_else(|| {
                        response
                            .status()
                            .canonical_reason()
                            .unwrap_or("upgrade rejected")
                            .to_string()
                    });
                LinkError::Http { status, message }
            }
            WsError::Protocol(p) => LinkError::WebSocketError(p.to_string()),
            WsError::Io(io) => LinkError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => LinkError::TlsError(tls.to_string()),
            WsError::Url(url) => LinkError::InvalidUrl(url.to_string()),
            other => LinkError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for LinkError {
    fn from(err: toml::ser::Error) -> Self {
        LinkError::ConfigSaveFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        assert_eq!(
            LinkError::http(401, "nope").auth_category(),
            Some(AuthCategory::Unauthorized)
        );
        assert_eq!(
            LinkError::http(403, "nope").auth_category(),
            Some(AuthCategory::Forbidden)
        );
        assert_eq!(
            LinkError::auth(AuthCategory::RefreshFailed, "refresh endpoint 400").auth_category(),
            Some(AuthCategory::RefreshFailed)
        );
        assert!(LinkError::http(500, "boom").auth_category().is_none());
        assert_eq!(LinkError::http(403, "").kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_message_text_does_not_classify() {
        // Only structure counts; the words in the message are irrelevant.
        let err = LinkError::ConnectionFailed("401 Unauthorized: token expired".into());
        assert!(!err.is_authentication());
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(LinkError::ConnectionFailed("network".into()).is_retryable());
        assert!(LinkError::Disconnected.is_retryable());
        assert!(LinkError::PublishFailed("socket closed".into()).is_retryable());
        assert!(LinkError::http(503, "busy").is_retryable());

        assert!(!LinkError::NotConnected.is_retryable());
        assert!(!LinkError::http(401, "").is_retryable());
        assert!(!LinkError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(LinkError::NotConnected.kind(), ErrorKind::Publish);
        assert_eq!(LinkError::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(
            LinkError::MalformedPayload("x".into()).kind(),
            ErrorKind::MalformedPayload
        );
        assert_eq!(LinkError::InvalidUrl("x".into()).kind(), ErrorKind::Config);
        assert_eq!(ErrorKind::Authentication.to_string(), "authentication");
    }

    #[test]
    fn test_core_error_conversion() {
        let err: LinkError = CoreError::TokenExpired("2024-01-01T00:00:00Z".into()).into();
        assert_eq!(err.auth_category(), Some(AuthCategory::TokenExpired));

        let err: LinkError = CoreError::MalformedPayload("eof".into()).into();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    }
}
