//! Fan-out of encoded frames to connections and rooms.
//!
//! Each connection owns one bounded outbound queue registered in the
//! [`ConnectionHub`]. Rooms are sets of socket ids kept by the
//! [`RoomManager`]; a fan-out snapshots the member set under the lock,
//! releases it, then pushes the pre-encoded frame into each queue.
//!
//! ```text
//!                 ┌──────────── RoomManager ────────────┐
//!  fan_out(room) ─┤ "u1:u2" → { s1, s2 }                │
//!                 │ "lobby" → { s1, s3, s4 }            │
//!                 └───────────────┬─────────────────────┘
//!                                 │ snapshot
//!                                 ▼
//!                 ┌──────────── ConnectionHub ──────────┐
//!                 │ s1 → mpsc ─► connection task s1     │
//!                 │ s2 → mpsc ─► connection task s2     │
//!                 └─────────────────────────────────────┘
//! ```
//!
//! Sends never wait on a recipient: a full queue drops the frame for
//! that recipient only and counts it in [`BroadcastStats`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A pre-encoded outbound text frame, shared by all recipients.
pub type Frame = Arc<str>;

/// Opaque identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(Uuid);

impl SocketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Outbound queues of all live connections, keyed by socket id.
pub struct ConnectionHub {
    senders: RwLock<HashMap<SocketId, mpsc::Sender<Frame>>>,
    /// Frames buffered per connection before drops start
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl ConnectionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connection and return the receiving end of its queue.
    pub async fn register(&self, socket_id: SocketId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.write().await.insert(socket_id, tx);
        rx
    }

    pub async fn unregister(&self, socket_id: SocketId) -> bool {
        self.senders.write().await.remove(&socket_id).is_some()
    }

    /// Queue a frame for one connection. Returns `true` if it was queued.
    pub async fn send(&self, socket_id: SocketId, frame: Frame) -> bool {
        let senders = self.senders.read().await;
        match senders.get(&socket_id) {
            Some(tx) => self.deliver(socket_id, tx, frame),
            None => false,
        }
    }

    /// Queue a frame for many connections. Returns how many accepted it.
    pub async fn send_many(&self, socket_ids: &[SocketId], frame: &Frame) -> usize {
        let senders = self.senders.read().await;
        socket_ids
            .iter()
            .filter(|id| {
                senders
                    .get(*id)
                    .is_some_and(|tx| self.deliver(**id, tx, frame.clone()))
            })
            .count()
    }

    fn deliver(&self, socket_id: SocketId, tx: &mpsc::Sender<Frame>, frame: Frame) -> bool {
        match tx.try_send(frame) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for socket {socket_id}, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn is_connected(&self, socket_id: SocketId) -> bool {
        self.senders.read().await.contains_key(&socket_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps canonical room ids to member sockets.
///
/// Membership lives only as long as the connection; nothing here is
/// persisted.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, HashSet<SocketId>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket to a room. Returns `false` if it was already a member.
    pub async fn join(&self, room_id: &str, socket_id: SocketId) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room_id.to_string()).or_default().insert(socket_id)
    }

    /// Remove a socket from a room, dropping the room once empty.
    pub async fn leave(&self, room_id: &str, socket_id: SocketId) -> bool {
        let mut rooms = self.rooms.write().await;
        Self::remove_member(&mut rooms, room_id, socket_id)
    }

    /// Remove a socket from every listed room under one lock.
    pub async fn leave_all<'a, I>(&self, room_ids: I, socket_id: SocketId) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut rooms = self.rooms.write().await;
        room_ids
            .into_iter()
            .filter(|room_id| Self::remove_member(&mut rooms, room_id, socket_id))
            .count()
    }

    fn remove_member(
        rooms: &mut HashMap<String, HashSet<SocketId>>,
        room_id: &str,
        socket_id: SocketId,
    ) -> bool {
        let Some(members) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(&socket_id);
        if members.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    /// Snapshot of a room's members.
    pub async fn members(&self, room_id: &str) -> Vec<SocketId> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room_id: &str, socket_id: SocketId) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|members| members.contains(&socket_id))
    }

    /// Deliver a frame to every current member of a room.
    ///
    /// Returns the number of members whose queue accepted the frame.
    pub async fn fan_out(&self, hub: &ConnectionHub, room_id: &str, frame: &Frame) -> usize {
        let members = self.members(room_id).await;
        if members.is_empty() {
            return 0;
        }
        hub.send_many(&members, frame).await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_hub_register_send_unregister() {
        let hub = ConnectionHub::new(8);
        let socket = SocketId::new();
        let mut rx = hub.register(socket).await;

        assert!(hub.is_connected(socket).await);
        assert!(hub.send(socket, frame("hello")).await);
        assert_eq!(&*rx.recv().await.unwrap(), "hello");

        assert!(hub.unregister(socket).await);
        assert!(!hub.send(socket, frame("late")).await);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_hub_full_queue_drops_without_blocking() {
        let hub = ConnectionHub::new(2);
        let socket = SocketId::new();
        let _rx = hub.register(socket).await;

        assert!(hub.send(socket, frame("1")).await);
        assert!(hub.send(socket, frame("2")).await);
        assert!(!hub.send(socket, frame("3")).await);

        let stats = hub.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_hub_closed_receiver() {
        let hub = ConnectionHub::new(4);
        let socket = SocketId::new();
        drop(hub.register(socket).await);
        assert!(!hub.send(socket, frame("x")).await);
        assert_eq!(hub.stats().await.messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_room_join_leave() {
        let rooms = RoomManager::new();
        let socket = SocketId::new();

        assert!(rooms.join("u1:u2", socket).await);
        assert!(!rooms.join("u1:u2", socket).await);
        assert!(rooms.is_member("u1:u2", socket).await);
        assert_eq!(rooms.room_count().await, 1);

        assert!(rooms.leave("u1:u2", socket).await);
        assert!(!rooms.is_member("u1:u2", socket).await);
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_leave_all() {
        let rooms = RoomManager::new();
        let a = SocketId::new();
        let b = SocketId::new();
        rooms.join("lobby", a).await;
        rooms.join("lobby", b).await;
        rooms.join("a:b", a).await;

        let joined = vec!["lobby".to_string(), "a:b".to_string(), "never".to_string()];
        assert_eq!(rooms.leave_all(&joined, a).await, 2);

        assert_eq!(rooms.members("lobby").await, vec![b]);
        assert_eq!(rooms.active_rooms().await, vec!["lobby".to_string()]);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_members_only() {
        let hub = ConnectionHub::new(8);
        let rooms = RoomManager::new();

        let a = SocketId::new();
        let b = SocketId::new();
        let outsider = SocketId::new();
        let mut rx_a = hub.register(a).await;
        let mut rx_b = hub.register(b).await;
        let mut rx_out = hub.register(outsider).await;

        rooms.join("a:b", a).await;
        rooms.join("a:b", b).await;

        let delivered = rooms.fan_out(&hub, "a:b", &frame("msg")).await;
        assert_eq!(delivered, 2);
        assert_eq!(&*rx_a.recv().await.unwrap(), "msg");
        assert_eq!(&*rx_b.recv().await.unwrap(), "msg");
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_empty_room() {
        let hub = ConnectionHub::new(8);
        let rooms = RoomManager::new();
        assert_eq!(rooms.fan_out(&hub, "nobody", &frame("x")).await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_skips_unregistered_member() {
        let hub = ConnectionHub::new(8);
        let rooms = RoomManager::new();
        let gone = SocketId::new();
        rooms.join("lobby", gone).await;
        assert_eq!(rooms.fan_out(&hub, "lobby", &frame("x")).await, 0);
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(ConnectionHub::new(0).capacity(), 1);
        assert_eq!(ConnectionHub::new(32).capacity(), 32);
    }
}
