//! Channel data types: identifiers, messages, connection state, events

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned channel (chat room) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One chat message, as carried by history and by `MESSAGE` frame bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "senderId", default)]
    pub sender_id: Option<i64>,
    pub content: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Outbound `SEND` body.
#[derive(Debug, Serialize)]
pub(crate) struct OutboundMessage<'a> {
    #[serde(rename = "chatRoomId")]
    pub channel_id: ChannelId,
    pub content: &'a str,
}

/// Lifecycle of the persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Gauge value for `chat_connection_state`.
    pub fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// What the session reports to its single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A subscription became active; later messages belong to this channel
    Subscribed { channel_id: ChannelId },
    /// Inbound message on the active subscription
    Message {
        channel_id: ChannelId,
        message: Message,
    },
    /// Handshake rejected and renewal failed; login required
    AuthFailed,
    /// Transport closed without a `disconnect()` call
    Disconnected,
}
