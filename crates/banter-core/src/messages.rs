//! Wire message types.
//!
//! Every frame the server sends is a JSON object with a `type`
//! discriminant. Chat frames are the unit of history; history and
//! user_update frames are synthesized by the hub.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::profile::ProfileRecord;

/// Frame discriminant carried in the `type` field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    History,
    UserUpdate,
    /// Anything we don't recognize. Still broadcast, never persisted.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A chat-style message as it appears on the wire.
///
/// Deserialization is deliberately lenient: any JSON object parses, with
/// missing fields defaulting, so non-chat frames flow through the same
/// path and are classified by `kind` alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub username: String,
    pub photo_url: String,
    pub text: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Build an outgoing chat message stamped with the sender's current
    /// profile and a server-assigned timestamp. Client-supplied identity
    /// fields are never used.
    pub fn outgoing(sender: &ProfileRecord, text: impl Into<String>) -> Self {
        Self {
            username: sender.username.clone(),
            photo_url: sender.photo_url.clone(),
            text: text.into(),
            timestamp: Utc::now().format("%H:%M").to_string(),
            kind: MessageKind::Chat,
        }
    }

    pub fn is_chat(&self) -> bool {
        self.kind == MessageKind::Chat
    }
}

/// One-shot replay of recent messages, sent only to a newly registered
/// session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: Vec<ChatMessage>,
}

impl HistoryFrame {
    pub fn new(data: Vec<ChatMessage>) -> Self {
        Self {
            kind: MessageKind::History,
            data,
        }
    }
}

/// Broadcast announcement that a connected user's profile changed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserUpdateFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub old_email: String,
    pub new_email: String,
    pub username: String,
    pub photo_url: String,
}

impl UserUpdateFrame {
    pub fn new(old_email: impl Into<String>, record: &ProfileRecord) -> Self {
        Self {
            kind: MessageKind::UserUpdate,
            old_email: old_email.into(),
            new_email: record.email.clone(),
            username: record.username.clone(),
            photo_url: record.photo_url.clone(),
        }
    }
}

/// Extract the message body from an inbound client frame.
///
/// Valid JSON with a `text` field yields that field; anything else is
/// taken as the body verbatim.
pub fn message_body(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match value.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_owned(),
            None => raw.to_owned(),
        },
        Err(_) => raw.to_owned(),
    }
}
