//! Presence tracking: which socket currently speaks for which user.
//!
//! ```text
//! connect(u1, s7)      disconnect(u1)
//!      │                    │
//!      ▼                    ▼
//! set_online(u1, s7)   set_offline(u1)
//!      │                    │
//!      ▼                    ▼
//! u1 → { s7, online }  u1 → { s7, offline }   (socket retained)
//! ```
//!
//! One record per user, last write wins: a second connection for the
//! same user replaces the socket of the first. The tracker does no I/O;
//! durable presence flags are written by the engine through
//! [`PresenceRepository`](crate::collaborators::PresenceRepository).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::broadcast::SocketId;

/// Last known presence of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Most recently registered socket (kept after going offline).
    pub socket_id: SocketId,
    pub online: bool,
    /// Time of the last online/offline transition.
    pub last_seen: DateTime<Utc>,
}

/// Outcome of [`PresenceTracker::set_online`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// The user was unknown or offline.
    CameOnline,
    /// The user was online through a different socket.
    SocketChanged,
    /// Same socket, already online.
    Unchanged,
}

impl PresenceChange {
    /// Whether peers should hear about this change.
    pub fn is_transition(self) -> bool {
        !matches!(self, PresenceChange::Unchanged)
    }
}

/// Lock-guarded presence map shared by all connection handlers.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: RwLock<HashMap<String, PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `socket_id` as current for `user_id` and mark it online.
    pub async fn set_online(&self, user_id: &str, socket_id: SocketId) -> PresenceChange {
        let mut records = self.records.write().await;
        let change = match records.get(user_id) {
            Some(record) if record.online && record.socket_id == socket_id => {
                return PresenceChange::Unchanged;
            }
            Some(record) if record.online => PresenceChange::SocketChanged,
            _ => PresenceChange::CameOnline,
        };

        records.insert(
            user_id.to_string(),
            PresenceRecord {
                socket_id,
                online: true,
                last_seen: Utc::now(),
            },
        );
        change
    }

    /// Mark `user_id` offline, keeping its socket mapping.
    ///
    /// Returns `true` if the user was online.
    pub async fn set_offline(&self, user_id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(user_id) {
            Some(record) if record.online => {
                record.online = false;
                record.last_seen = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Most recently seen socket, online or not.
    pub async fn socket_for(&self, user_id: &str) -> Option<SocketId> {
        self.records.read().await.get(user_id).map(|r| r.socket_id)
    }

    /// Socket of `user_id` if the user is currently online.
    pub async fn live_socket_for(&self, user_id: &str) -> Option<SocketId> {
        self.records
            .read()
            .await
            .get(user_id)
            .filter(|r| r.online)
            .map(|r| r.socket_id)
    }

    /// Live sockets for a set of users, read under a single lock.
    ///
    /// Users without a live socket are left out.
    pub async fn live_sockets_for<'a, I>(&self, user_ids: I) -> Vec<(String, SocketId)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let records = self.records.read().await;
        user_ids
            .into_iter()
            .filter_map(|id| {
                records
                    .get(id)
                    .filter(|r| r.online)
                    .map(|r| (id.to_string(), r.socket_id))
            })
            .collect()
    }

    pub async fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.read().await.get(user_id).copied()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(user_id)
            .is_some_and(|r| r.online)
    }

    pub async fn online_count(&self) -> usize {
        self.records.read().await.values().filter(|r| r.online).count()
    }

    /// Consistent copy of every record, taken under one read lock.
    pub async fn snapshot(&self) -> HashMap<String, PresenceRecord> {
        self.records.read().await.clone()
    }
}
