//! JSON wire protocol for collaboration events.
//!
//! One JSON object per message, discriminated by the `event` field:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ {"event": "row_update", "row_id": …, "row_version": 2, …}│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Client → server kinds: heartbeat, view_change, focus_change,
//! filter_sort_update, chat_message.
//! Server → client kinds: heartbeat_ack, init, user_joined, user_left,
//! user_view_changed, user_focus_changed, row_update, filter_sort_update,
//! chat_message.
//!
//! `init` carries the full presence list at connect time; everything else is
//! an incremental delta. Unknown inbound kinds decode to an explicit
//! [`ProtocolError::UnknownEvent`] so the dispatcher can log and ignore them
//! without tearing down the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::UserId;

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not a JSON object or is missing required fields.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Payload is well-formed JSON but carries an unrecognized `event` kind.
    #[error("unknown event kind '{0}'")]
    UnknownEvent(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One column of a sort model, in application order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortModelItem {
    pub column_name: String,
    /// "asc" / "desc", or `None` when the column is unsorted.
    #[serde(default)]
    pub sort_direction: Option<String>,
}

/// Presence entry as it appears on the wire (`init` payload and friends).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceUser {
    pub id: UserId,
    pub username: String,
    /// Hex color assigned from the project palette.
    pub color: String,
    pub joined_at: i64,
    #[serde(default)]
    pub current_view_id: Option<Uuid>,
    #[serde(default)]
    pub focused_row_id: Option<Uuid>,
}

/// Messages sent by clients over an established collaboration socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Keep-alive; refreshes presence TTL, answered with `heartbeat_ack`.
    Heartbeat,
    /// The user navigated to a different view (or away from all views).
    ViewChange {
        #[serde(default)]
        view_id: Option<Uuid>,
    },
    /// The user focused a different row (or cleared focus).
    FocusChange {
        #[serde(default)]
        row_id: Option<Uuid>,
    },
    /// The user changed their per-view filter/sort preference.
    FilterSortUpdate {
        view_id: Uuid,
        filter_model: serde_json::Value,
        sort_model: Vec<SortModelItem>,
    },
    /// Free-form chat, fanned out to the whole project.
    ChatMessage {
        content: String,
        #[serde(default)]
        view_id: Option<Uuid>,
    },
}

impl ClientEvent {
    const KINDS: &'static [&'static str] = &[
        "heartbeat",
        "view_change",
        "focus_change",
        "filter_sort_update",
        "chat_message",
    ];

    /// Decode one JSON-line message from a client.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value = parse_tagged(text)?;
        let kind = event_kind(&value)?;
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownEvent(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to a JSON line.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Messages sent by the server, over sockets and through the event bus.
///
/// Every collaboration-visible state change is one of these; processes
/// converge by replaying them off the project channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to a client heartbeat.
    HeartbeatAck,
    /// Full presence list, sent once right after connect.
    Init { users: Vec<PresenceUser> },
    UserJoined {
        id: UserId,
        username: String,
        color: String,
    },
    UserLeft {
        id: UserId,
    },
    UserViewChanged {
        id: UserId,
        current_view_id: Option<Uuid>,
    },
    UserFocusChanged {
        id: UserId,
        focused_row_id: Option<Uuid>,
    },
    /// A cell mutation committed with a fresh version stamp.
    RowUpdate {
        row_id: Uuid,
        column_name: String,
        value: serde_json::Value,
        row_version: i64,
        view_id: Uuid,
    },
    FilterSortUpdate {
        view_id: Option<Uuid>,
        filter_model: serde_json::Value,
        sort_model: Vec<SortModelItem>,
    },
    ChatMessage {
        message_id: Uuid,
        content: String,
        user_id: UserId,
        user_username: String,
        #[serde(default)]
        view_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    },
}

impl ServerEvent {
    const KINDS: &'static [&'static str] = &[
        "heartbeat_ack",
        "init",
        "user_joined",
        "user_left",
        "user_view_changed",
        "user_focus_changed",
        "row_update",
        "filter_sort_update",
        "chat_message",
    ];

    /// Decode one JSON-line message (socket or bus payload).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value = parse_tagged(text)?;
        let kind = event_kind(&value)?;
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownEvent(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to a JSON line.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// The wire discriminator for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Init { .. } => "init",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserViewChanged { .. } => "user_view_changed",
            Self::UserFocusChanged { .. } => "user_focus_changed",
            Self::RowUpdate { .. } => "row_update",
            Self::FilterSortUpdate { .. } => "filter_sort_update",
            Self::ChatMessage { .. } => "chat_message",
        }
    }
}

fn parse_tagged(text: &str) -> Result<serde_json::Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn event_kind(value: &serde_json::Value) -> Result<String, ProtocolError> {
    value
        .get("event")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::Malformed("missing event discriminator".into()))
}
