use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared presence channel every lobby member subscribes to
pub const LOBBY_CHANNEL: &str = "presence-lobby";

/// Prefix of the private per-session channels
pub const SESSION_CHANNEL_PREFIX: &str = "private-session-";

/// Channel name for a session
pub fn session_channel(session_id: &str) -> String {
    format!("{}{}", SESSION_CHANNEL_PREFIX, session_id)
}

/// Extract the session id from a session channel name
pub fn session_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(SESSION_CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Membership is tracked and announced by the transport
    Presence,
    /// Subscription requires a signature from the channel authorizer
    Private,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Option<Self> {
        if channel.starts_with("presence-") {
            Some(Self::Presence)
        } else if channel.starts_with("private-") {
            Some(Self::Private)
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unparseable event '{event}': {source}")]
    InvalidEvent {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Every event that can travel over a channel.
///
/// Serialized as `{"event": "<name>", "data": {...}}` so the wire form matches
/// the transport's `publish(channel, eventName, payload)` contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ChannelEvent {
    // Transport-native presence events
    SubscriptionSucceeded {
        members: Vec<PresenceMember>,
    },
    MemberAdded {
        member: PresenceMember,
    },
    MemberRemoved {
        member: PresenceMember,
    },

    // Lobby events
    ChatRequest {
        from_user: String,
        target_user: String,
        session_id: SessionId,
        /// Sender's clock; both sides expire the invite from it
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    ChatAccepted {
        from_user: String,
        target_user: String,
        session_id: SessionId,
    },
    ChatRejected {
        from_user: String,
        target_user: String,
        session_id: SessionId,
    },
    /// An AI persona left the lobby because its session ended
    AiLeft {
        session_id: SessionId,
        ai_id: PersonaId,
    },

    // Session events
    NewMessage {
        sender: String,
        content: String,
        role: MessageRole,
        timestamp: DateTime<Utc>,
    },
    PhaseChange {
        session_id: SessionId,
        phase: Phase,
    },
}

impl ChannelEvent {
    /// Validate an untyped `(event name, payload)` pair received from a client
    pub fn parse(event: &str, data: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(serde_json::json!({ "event": event, "data": data })).map_err(
            |source| ProtocolError::InvalidEvent {
                event: event.to_string(),
                source,
            },
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscriptionSucceeded { .. } => "subscription-succeeded",
            Self::MemberAdded { .. } => "member-added",
            Self::MemberRemoved { .. } => "member-removed",
            Self::ChatRequest { .. } => "chat-request",
            Self::ChatAccepted { .. } => "chat-accepted",
            Self::ChatRejected { .. } => "chat-rejected",
            Self::AiLeft { .. } => "ai-left",
            Self::NewMessage { .. } => "new-message",
            Self::PhaseChange { .. } => "phase-change",
        }
    }

    /// Presence events may only originate from the transport itself
    pub fn is_transport_native(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionSucceeded { .. } | Self::MemberAdded { .. } | Self::MemberRemoved { .. }
        )
    }

    /// The user an event claims to come from, checked against the publisher
    pub fn claimed_sender(&self) -> Option<&str> {
        match self {
            Self::ChatRequest { from_user, .. }
            | Self::ChatAccepted { from_user, .. }
            | Self::ChatRejected { from_user, .. } => Some(from_user),
            Self::NewMessage { sender, .. } => Some(sender),
            _ => None,
        }
    }

    /// Whether a client may publish this event on the given channel
    pub fn allowed_on(&self, channel: &str) -> bool {
        if self.is_transport_native() {
            return false;
        }
        match self {
            Self::ChatRequest { .. }
            | Self::ChatAccepted { .. }
            | Self::ChatRejected { .. }
            | Self::AiLeft { .. } => channel == LOBBY_CHANNEL,
            Self::NewMessage { .. } => session_id_from_channel(channel).is_some(),
            Self::PhaseChange { session_id, .. } => {
                session_id_from_channel(channel) == Some(session_id.as_str())
            }
            _ => false,
        }
    }

    pub fn from_message(message: &Message) -> Self {
        Self::NewMessage {
            sender: message.sender.clone(),
            content: message.content.clone(),
            role: message.role,
            timestamp: message.timestamp,
        }
    }
}

/// One event as delivered to one connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub channel: String,
    pub event: ChannelEvent,
}

/// Messages a WebSocket client sends to the hub bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        /// Signature from `/api/channel-auth`, required for private channels
        #[serde(default)]
        auth: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    /// Untyped on purpose: the payload is validated against the event schema on receipt
    Publish {
        channel: String,
        event: String,
        data: serde_json::Value,
    },
    Ping,
}

/// Messages the hub bridge sends to a WebSocket client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        connection_id: ConnectionId,
        name: String,
        server_now: String,
    },
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Published {
        channel: String,
        event: String,
    },
    Event {
        channel: String,
        payload: ChannelEvent,
    },
    Pong,
    Error {
        code: String,
        msg: String,
    },
}
