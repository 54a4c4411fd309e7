//! # Error Types
//!
//! Domain-specific error types for herald-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  herald-core errors (this file)                                        │
//! │  ├── CoreError        - Session / payload shape failures               │
//! │  └── AuthCategory     - Structured authentication taxonomy             │
//! │                                                                         │
//! │  herald-link errors (separate crate)                                   │
//! │  └── LinkError        - Transport, protocol, publish, auth failures    │
//! │                                                                         │
//! │  Flow: HTTP status / token check ─► AuthCategory ─► AuthGuard ─► Logout │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Authentication failures are classified by an explicit category set at the
//!    boundary where they are detected, never by reading message text

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Authentication Category
// =============================================================================

/// Category of an authentication-class failure.
///
/// Populated where the failure is detected (HTTP response, token check,
/// refresh flow). Consumers match on the variant, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AuthCategory {
    /// The access token is past its expiry.
    TokenExpired,
    /// Exchanging the refresh token for a new access token failed.
    RefreshFailed,
    /// The token is malformed or was rejected as invalid.
    InvalidToken,
    /// The server answered 401.
    Unauthorized,
    /// The server answered 403.
    Forbidden,
}

impl AuthCategory {
    /// Maps an HTTP status code onto a category.
    ///
    /// Only 401 and 403 are authentication-class.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(AuthCategory::Unauthorized),
            403 => Some(AuthCategory::Forbidden),
            _ => None,
        }
    }

    /// The HTTP status conventionally associated with this category.
    pub fn http_status(&self) -> u16 {
        match self {
            AuthCategory::Forbidden => 403,
            _ => 401,
        }
    }
}

impl std::fmt::Display for AuthCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthCategory::TokenExpired => write!(f, "token-expired"),
            AuthCategory::RefreshFailed => write!(f, "refresh-failed"),
            AuthCategory::InvalidToken => write!(f, "invalid-token"),
            AuthCategory::Unauthorized => write!(f, "unauthorized"),
            AuthCategory::Forbidden => write!(f, "forbidden"),
        }
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The bearer token could not be read.
    ///
    /// ## When This Occurs
    /// - Token is not a three-part JWT
    /// - Claims segment is not valid base64/JSON
    #[error("Invalid session token: {0}")]
    InvalidToken(String),

    /// The token carries no identity and none was supplied.
    #[error("Session token has no subject claim")]
    MissingIdentity,

    /// The token is already expired.
    #[error("Session token expired at {0}")]
    TokenExpired(String),

    /// An inbound notification body did not have the expected shape.
    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),
}

impl CoreError {
    /// Returns the authentication category for session errors.
    ///
    /// Payload errors are not authentication-class and return `None`.
    pub fn auth_category(&self) -> Option<AuthCategory> {
        match self {
            CoreError::InvalidToken(_) | CoreError::MissingIdentity => {
                Some(AuthCategory::InvalidToken)
            }
            CoreError::TokenExpired(_) => Some(AuthCategory::TokenExpired),
            CoreError::MalformedPayload(_) => None,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::MalformedPayload(err.to_string())
    }
}
