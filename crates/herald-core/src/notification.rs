//! # Notifications
//!
//! The inbound payload carried by a `MESSAGE` frame on the per-user queue,
//! and the immutable [`Notification`] built from it.
//!
//! ## Wire Shape
//! ```json
//! {
//!   "title": "Class moved",
//!   "content": "Yoga starts at 18:30 today",
//!   "notificationType": "SCHEDULE",
//!   "classId": 812
//! }
//! ```
//! `title`, `content` and `notificationType` are required. `id` and
//! `createdAt` are optional. `createdAt` may be an RFC 3339 string or epoch
//! milliseconds; any other shape is kept in [`Notification::extra`]. Every
//! other field is preserved there too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Inbound Payload
// =============================================================================

/// Body of an inbound notification frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Server-side identifier (string or number), if the server sends one.
    #[serde(default)]
    pub id: Option<Value>,

    /// Short headline.
    pub title: String,

    /// Body text.
    pub content: String,

    /// Category tag, e.g. `SYSTEM`, `APPOINTMENT`, `SURVEY`.
    pub notification_type: String,

    /// Server creation time, as sent.
    #[serde(default)]
    pub created_at: Option<Value>,

    /// Fields we do not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationPayload {
    /// Parses a frame body.
    pub fn from_json(body: &str) -> CoreResult<Self> {
        serde_json::from_str(body).map_err(CoreError::from)
    }
}

// =============================================================================
// Notification
// =============================================================================

/// A notification in the feed.
///
/// Immutable once created except for `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Notification {
    /// Unique identifier (server-provided or generated UUID v4).
    pub id: String,

    /// Short headline.
    pub title: String,

    /// Body text.
    pub body: String,

    /// Category tag.
    pub category: String,

    /// When the server created it (falls back to receipt time).
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    /// When this client received it.
    #[ts(as = "String")]
    pub received_at: DateTime<Utc>,

    /// Read flag. The only mutable field.
    pub is_read: bool,

    /// Unknown inbound fields, preserved as-is.
    #[ts(type = "Record<string, unknown>")]
    pub extra: Map<String, Value>,
}

impl Notification {
    /// Creates an unread notification received at `received_at`.
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        category: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Notification {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            category: category.into(),
            created_at: received_at,
            received_at,
            is_read: false,
            extra: Map::new(),
        }
    }

    /// Builds a notification from a parsed payload with a local receipt time.
    pub fn from_payload(payload: NotificationPayload, received_at: DateTime<Utc>) -> Self {
        let NotificationPayload {
            id,
            title,
            content,
            notification_type,
            created_at,
            mut extra,
        } = payload;

        let id = match id {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let created_at = match created_at {
            Some(raw) => match parse_timestamp(&raw) {
                Some(ts) => ts,
                None => {
                    extra.insert("createdAt".to_string(), raw);
                    received_at
                }
            },
            None => received_at,
        };

        Notification {
            id,
            title,
            body: content,
            category: notification_type,
            created_at,
            received_at,
            is_read: false,
            extra,
        }
    }

    /// Parses a frame body and builds a notification in one step.
    pub fn parse(body: &str, received_at: DateTime<Utc>) -> CoreResult<Self> {
        NotificationPayload::from_json(body).map(|p| Self::from_payload(p, received_at))
    }
}

/// RFC 3339 string or integer epoch milliseconds.
fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
