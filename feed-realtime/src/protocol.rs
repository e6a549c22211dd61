//! JSON event protocol spoken over the chat WebSocket.
//!
//! Every text frame carries one event envelope:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ { "event": "chat:join", "data": { "type": "single",          │
//! │                                   "id": "<peer user id>" } } │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound events are decoded into [`ClientEvent`] by a single
//! decode-then-validate step. Outbound events are [`ServerEvent`]s,
//! encoded once and shared by every recipient of a fan-out.

use crate::room::ROOM_SEPARATOR;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inbound: join a room and receive its history.
pub const EVENT_JOIN: &str = "chat:join";
/// Inbound: send a message. Outbound: a message delivered to a room.
pub const EVENT_MESSAGE: &str = "chat:message";
/// Outbound: history delivered to a joining connection.
pub const EVENT_HISTORY: &str = "chat:messages";
/// Outbound: error delivered to the offending connection only.
pub const EVENT_ERROR: &str = "chat:error";
/// Outbound: presence change of a mutual peer.
pub const EVENT_PRESENCE: &str = "user:active";

/// Room addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Globally named room; `id` is the room name.
    Group,
    /// Direct conversation; `id` is the other participant's user id.
    Single,
}

/// Room descriptor as supplied by the client with each request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomDescriptor {
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub id: String,
}

impl RoomDescriptor {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Group,
            id: name.into(),
        }
    }

    pub fn single(peer_id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Single,
            id: peer_id.into(),
        }
    }

    /// A non-empty id free of the direct-room separator, so a group name
    /// can never resolve to the same key as a direct room.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.id.contains(ROOM_SEPARATOR)
    }
}

/// Authenticated user identity, as resolved by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join(RoomDescriptor),
    Message { room: RoomDescriptor, content: String },
}

#[derive(Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

#[derive(Serialize, Deserialize)]
struct MessageRequest {
    content: String,
    room: RoomDescriptor,
}

impl ClientEvent {
    /// Decode and validate one inbound text frame.
    ///
    /// Payload shape failures are reported per event so the caller can
    /// answer with the matching `chat:error` text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;

        match envelope.event.as_str() {
            EVENT_JOIN => {
                let room: RoomDescriptor = serde_json::from_value(envelope.data)
                    .map_err(|_| ProtocolError::InvalidRoom)?;
                if !room.is_valid() {
                    return Err(ProtocolError::InvalidRoom);
                }
                Ok(ClientEvent::Join(room))
            }
            EVENT_MESSAGE => {
                let request: MessageRequest = serde_json::from_value(envelope.data)
                    .map_err(|_| ProtocolError::InvalidMessage)?;
                if request.content.is_empty() || !request.room.is_valid() {
                    return Err(ProtocolError::InvalidMessage);
                }
                Ok(ClientEvent::Message {
                    room: request.room,
                    content: request.content,
                })
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Encode as a text frame (client side).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = match self {
            ClientEvent::Join(room) => serde_json::to_string(&OutboundEnvelope {
                event: EVENT_JOIN,
                data: room,
            })?,
            ClientEvent::Message { room, content } => serde_json::to_string(&OutboundEnvelope {
                event: EVENT_MESSAGE,
                data: &MessageRequest {
                    content: content.clone(),
                    room: room.clone(),
                },
            })?,
        };
        Ok(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => EVENT_JOIN,
            ClientEvent::Message { .. } => EVENT_MESSAGE,
        }
    }
}

/// A chat message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub id: String,
    pub content: String,
    pub from: Identity,
    pub created_at: DateTime<Utc>,
}

/// Presence change of a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub id: String,
    pub username: String,
    pub is_online: bool,
    pub last_online: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Room history, newest first.
    #[serde(rename = "chat:messages")]
    History(Vec<ChatMessagePayload>),
    #[serde(rename = "chat:message")]
    Message(ChatMessagePayload),
    #[serde(rename = "chat:error")]
    Error(ErrorPayload),
    #[serde(rename = "user:active")]
    Presence(PresencePayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::History(_) => EVENT_HISTORY,
            ServerEvent::Message(_) => EVENT_MESSAGE,
            ServerEvent::Error(_) => EVENT_ERROR,
            ServerEvent::Presence(_) => EVENT_PRESENCE,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid room data")]
    InvalidRoom,
    #[error("Invalid message data")]
    InvalidMessage,
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl ProtocolError {
    /// Text reported back to the client, if this error is reported at all.
    pub fn client_message(&self) -> Option<String> {
        match self {
            ProtocolError::InvalidRoom | ProtocolError::InvalidMessage => Some(self.to_string()),
            ProtocolError::Malformed(_) | ProtocolError::UnknownEvent(_) => None,
        }
    }
}
