//! # Session
//!
//! An authenticated session: the bearer token handed to us by the host app and
//! the identity it belongs to. The identity selects the per-user notification
//! queue, so it must be known before the channel subscribes.
//!
//! ## Token Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Session Construction                            │
//! │                                                                         │
//! │  Host app has token ──► Session::from_jwt(token)                        │
//! │                              │                                          │
//! │                              ├─ decode claims (signature NOT checked)   │
//! │                              ├─ sub  ──► identity                       │
//! │                              └─ exp  ──► expires_at                     │
//! │                                                                         │
//! │  Opaque token (not a JWT) ──► Session::new(token, identity)             │
//! │                                                                         │
//! │  The broker verifies signatures. The client only needs to read who     │
//! │  the token is for and when it stops being useful.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// Claims we read from a bearer token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// An authenticated user session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Session {
    /// Bearer token sent on connect.
    pub token: String,

    /// Identity the token was issued to.
    pub identity: String,

    /// Token expiry, when the token carries one.
    #[ts(as = "Option<String>")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Creates a session from an opaque token and a known identity.
    pub fn new(token: impl Into<String>, identity: impl Into<String>) -> Self {
        Session {
            token: token.into(),
            identity: identity.into(),
            expires_at: None,
        }
    }

    /// Creates a session by reading the `sub` and `exp` claims of a JWT.
    ///
    /// The signature is not verified.
    pub fn from_jwt(token: impl Into<String>) -> CoreResult<Self> {
        let token = token.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = decode::<TokenClaims>(&token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| CoreError::InvalidToken(e.to_string()))?;

        let identity = data
            .claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingIdentity)?;

        let expires_at = data
            .claims
            .exp
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));

        Ok(Session {
            token,
            identity,
            expires_at,
        })
    }

    /// Sets the expiry explicitly.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns true if the token has an expiry at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Fails with [`CoreError::TokenExpired`] when the token is past its expiry.
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> CoreResult<()> {
        match self.expires_at {
            Some(exp) if exp <= now => Err(CoreError::TokenExpired(exp.to_rfc3339())),
            _ => Ok(()),
        }
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

// Tokens never end up in logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("identity", &self.identity)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
