//! In-memory message store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{HistoryQuery, MessageStore, NewChatMessage, StoredMessage};
use crate::error::CollaboratorError;

#[derive(Debug, Default)]
struct Inner {
    rooms: HashMap<String, Vec<StoredMessage>>,
    next_sequence: u64,
}

/// Message store held in process memory, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: RwLock<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.rooms.values().map(Vec::len).sum()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewChatMessage) -> Result<StoredMessage, CollaboratorError> {
        let mut inner = self.inner.write().await;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let stored = StoredMessage::from_new(message, sequence);
        inner
            .rooms
            .entry(stored.room_key.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, CollaboratorError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rooms
            .get(&query.room_key)
            .map(|messages| messages.iter().rev().take(query.limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identity;
    use chrono::Utc;

    fn new_message(room: &str, content: &str) -> NewChatMessage {
        NewChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: Identity::new("u1", "alice"),
            room_key: room.to_string(),
            created_at: Utc::now(),
        }
    }

    fn query(room: &str, limit: usize) -> HistoryQuery {
        HistoryQuery {
            room_key: room.to_string(),
            limit,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequence() {
        let store = MemoryMessageStore::new();
        let a = store.append(new_message("lobby", "a")).await.unwrap();
        let b = store.append(new_message("u1:u2", "b")).await.unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(store.message_count().await, 2);
        assert_eq!(store.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_bounded() {
        let store = MemoryMessageStore::new();
        for i in 0..10 {
            store.append(new_message("lobby", &format!("m{i}"))).await.unwrap();
        }

        let page = store.history(&query("lobby", 3)).await.unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m9", "m8", "m7"]);
    }

    #[tokio::test]
    async fn test_history_is_room_scoped() {
        let store = MemoryMessageStore::new();
        store.append(new_message("lobby", "public")).await.unwrap();
        store.append(new_message("u1:u2", "private")).await.unwrap();

        let page = store.history(&query("u1:u2", 50)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "private");
        assert!(store.history(&query("empty", 50)).await.unwrap().is_empty());
    }
}
