//! Chat message persistence.
//!
//! ```text
//! ┌─────────────┐  append / history  ┌──────────────────────┐
//! │ FanOutEngine│ ─────────────────► │ dyn MessageStore     │
//! └─────────────┘                    ├──────────────────────┤
//!                                    │ MemoryMessageStore   │
//!                                    │ RocksMessageStore    │
//!                                    │  CF "messages"       │
//!                                    │  CF "meta"           │
//!                                    └──────────────────────┘
//! ```
//!
//! Every message is keyed by its canonical room id. History pages are
//! returned newest first, in append order.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CollaboratorError;
use crate::protocol::{ChatMessagePayload, Identity};

pub use memory::MemoryMessageStore;
pub use rocks::{RocksMessageStore, StoreConfig};

/// A message about to be persisted. Id and timestamp are assigned by the
/// sender's connection at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub id: String,
    pub content: String,
    pub sender: Identity,
    pub room_key: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-wide append position.
    pub sequence: u64,
    pub id: String,
    pub content: String,
    pub sender: Identity,
    pub room_key: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_new(message: NewChatMessage, sequence: u64) -> Self {
        Self {
            sequence,
            id: message.id,
            content: message.content,
            sender: message.sender,
            room_key: message.room_key,
            created_at: message.created_at,
        }
    }

    pub fn to_payload(&self) -> ChatMessagePayload {
        ChatMessagePayload {
            id: self.id.clone(),
            content: self.content.clone(),
            from: self.sender.clone(),
            created_at: self.created_at,
        }
    }
}

/// A bounded history page request.
///
/// The canonical room key alone scopes the page: group names never contain
/// the direct-room separator, so a key names exactly one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub room_key: String,
    pub limit: usize,
}

/// Durable append/query of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: NewChatMessage) -> Result<StoredMessage, CollaboratorError>;

    /// Up to `query.limit` messages of a room, newest first.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, CollaboratorError>;
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Column family missing: {0}")]
    MissingColumnFamily(&'static str),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
