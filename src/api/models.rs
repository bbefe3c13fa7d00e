use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::timestamp;

/// Conversation summary keyed by the peer's user id.
///
/// Field names follow the history service's JSON (`userId`, `username`,
/// `lastMessageTime`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    #[serde(rename = "userId")]
    pub peer_id: String,
    #[serde(rename = "username")]
    pub display_name: String,
    #[serde(rename = "lastMessage", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(
        rename = "lastMessageTime",
        default,
        with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: u32,
}

impl Conversation {
    /// A fresh conversation whose display name is the peer id until a
    /// directory lookup backfills it.
    pub fn placeholder(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: peer_id.to_string(),
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    pub fn has_placeholder_name(&self) -> bool {
        self.display_name.is_empty() || self.display_name == self.peer_id
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds.
    pub recorded_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(with = "timestamp")]
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Message {
    /// The other participant, seen from `me`.
    pub fn peer_of<'a>(&'a self, me: &str) -> &'a str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// The local copy of a message we are about to publish.
    pub fn outgoing(me: &str, payload: &OutboundPayload) -> Self {
        Self {
            id: payload.client_message_id.clone(),
            sender_id: me.to_string(),
            receiver_id: payload.receiver_id.clone(),
            content: payload.content.clone(),
            sent_at: payload.sent_at,
            location: payload.location,
        }
    }

    /// Normalizes a broker envelope addressed to `me`.
    pub fn inbound(me: &str, envelope: &InboundEnvelope, received_at: DateTime<Utc>) -> Self {
        Self {
            id: envelope.id.clone(),
            sender_id: envelope.from.clone(),
            receiver_id: me.to_string(),
            content: envelope.text.clone(),
            sent_at: envelope.time.unwrap_or(received_at),
            location: None,
        }
    }
}

/// Broker → client. The receiver is implicitly the local user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub from: String,
    pub text: String,
    #[serde(default, with = "timestamp::lenient", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, alias = "clientMessageId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Client → broker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPayload {
    pub receiver_id: String,
    #[serde(with = "timestamp")]
    pub sent_at: DateTime<Utc>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Idempotency key so echoes and redeliveries can be recognised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}
