//! Connection life-cycle and chat fan-out.
//!
//! ```text
//!  handshake ──► authenticate() ──► Authenticated ──► activate() ──► ActiveConnection
//!                    │ no identity                       │                 │
//!                    ▼                                   │ presence on     │ chat:join
//!                 rejected                               │ peers notified  │ chat:message
//!                                                        ▼                 ▼
//!                                                  disconnect() ◄──── transport closed
//!                                                        │
//!                                                        ▼
//!                                             presence off, peers notified
//! ```
//!
//! The states are types: an [`Authenticated`] can only come from
//! [`FanOutEngine::authenticate`], an [`ActiveConnection`] only from
//! [`FanOutEngine::activate`], and [`FanOutEngine::disconnect`] consumes it.
//!
//! Events of one connection are handled one at a time by its own task, so
//! they take effect in the order the client sent them. Every collaborator
//! call is bounded by [`EngineConfig::collaborator_timeout`]; a failed call
//! aborts only the request that made it.

use chrono::{SubsecRound, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{ConnectionHub, Frame, RoomManager, SocketId};
use crate::collaborators::{Collaborators, Handshake};
use crate::error::{ChatError, CollaboratorError};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ChatMessagePayload, ClientEvent, Identity, PresencePayload, ProtocolError, RoomDescriptor,
    ServerEvent,
};
use crate::room;
use crate::storage::{HistoryQuery, NewChatMessage, StoredMessage};

/// Reported to a client when a collaborator fails during its request.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
/// Reported to the sender when a message could not be persisted.
pub const SEND_FAILED_MESSAGE: &str = "Message could not be sent";

const SESSION_STORE: &str = "session store";
const CONNECTION_GRAPH: &str = "connection graph";
const MESSAGE_STORE: &str = "message store";
const USER_REPOSITORY: &str = "user repository";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of messages delivered on join
    pub history_page_size: usize,
    /// Frames buffered per connection before drops start
    pub outbound_capacity: usize,
    /// Upper bound on each collaborator call
    pub collaborator_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            outbound_capacity: 256,
            collaborator_timeout: Duration::from_secs(5),
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub messages_relayed: u64,
    pub messages_failed: u64,
    pub validation_errors: u64,
    pub frames_dropped: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub online_users: usize,
}

#[derive(Default)]
struct AtomicEngineStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    messages_relayed: AtomicU64,
    messages_failed: AtomicU64,
    validation_errors: AtomicU64,
}

/// A connection whose identity has been resolved but which is not yet active.
#[derive(Debug)]
pub struct Authenticated {
    identity: Identity,
}

impl Authenticated {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// An active connection. Owned by the task serving it.
#[derive(Debug)]
pub struct ActiveConnection {
    socket_id: SocketId,
    identity: Identity,
    /// Canonical ids of rooms joined over this connection
    joined: HashSet<String>,
    outbound: Option<mpsc::Receiver<Frame>>,
}

impl ActiveConnection {
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.joined.contains(room_id)
    }

    pub fn joined_rooms(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    /// Hand the outbound queue to the transport task.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.outbound.take()
    }

    /// Next outbound frame, while the queue has not been taken.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.as_mut()?.recv().await
    }

    /// All frames queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if let Some(rx) = self.outbound.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }
}

/// The chat fan-out engine, shared by all connection tasks.
pub struct FanOutEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    presence: PresenceTracker,
    hub: ConnectionHub,
    rooms: RoomManager,
    stats: AtomicEngineStats,
}

impl FanOutEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let hub = ConnectionHub::new(config.outbound_capacity);
        Self {
            config,
            collaborators,
            presence: PresenceTracker::new(),
            hub,
            rooms: RoomManager::new(),
            stats: AtomicEngineStats::default(),
        }
    }

    /// Run a collaborator call under the configured timeout.
    async fn call<T, F>(&self, collaborator: &'static str, fut: F) -> Result<T, ChatError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(self.config.collaborator_timeout, fut).await {
            Ok(result) => result.map_err(ChatError::from),
            Err(_) => Err(ChatError::Timeout {
                collaborator,
                after: self.config.collaborator_timeout,
            }),
        }
    }

    // ─── Connecting → Authenticated ──────────────────────────────

    /// Resolve the identity behind a handshake.
    ///
    /// Fails with [`ChatError::Unauthorized`] when the session store does
    /// not know the connection; the caller closes it without broadcasting.
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<Authenticated, ChatError> {
        let resolved = self
            .call(SESSION_STORE, self.collaborators.sessions.resolve(handshake))
            .await;
        match resolved {
            Ok(Some(identity)) => Ok(Authenticated { identity }),
            Ok(None) => {
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                Err(ChatError::Unauthorized)
            }
            Err(e) => {
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    // ─── Authenticated → Active ──────────────────────────────────

    /// Register the connection, mark its user online and tell the user's
    /// mutual peers.
    pub async fn activate(&self, authenticated: Authenticated) -> ActiveConnection {
        let identity = authenticated.identity;
        let socket_id = SocketId::new();
        let outbound = self.hub.register(socket_id).await;
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

        let change = self.presence.set_online(&identity.id, socket_id).await;
        log::info!(
            "User {} ({}) connected on socket {socket_id} ({change:?})",
            identity.username,
            identity.id
        );

        if let Err(e) = self.announce(&identity, true, change.is_transition()).await {
            log::error!("Presence announcement for {} failed: {e}", identity.id);
            self.send_error(socket_id, INTERNAL_ERROR_MESSAGE).await;
        }

        ActiveConnection {
            socket_id,
            identity,
            joined: HashSet::new(),
            outbound: Some(outbound),
        }
    }

    /// Persist the presence flag and, on a real transition, notify every
    /// mutual peer that has a live socket. Returns the number notified.
    ///
    /// A failed flag write is logged and does not hold back the peer
    /// notification; only a failed peer lookup is returned.
    async fn announce(
        &self,
        identity: &Identity,
        online: bool,
        transition: bool,
    ) -> Result<usize, ChatError> {
        if let Err(e) = self
            .call(
                USER_REPOSITORY,
                self.collaborators.users.set_online_flag(&identity.id, online),
            )
            .await
        {
            log::error!(
                "Durable presence flag for {} (online={online}) not written: {e}",
                identity.id
            );
        }

        if !transition {
            return Ok(0);
        }

        let peers = self
            .call(
                CONNECTION_GRAPH,
                self.collaborators.graph.active_peers(&identity.id),
            )
            .await?;

        let last_online = self.presence.record(&identity.id).await.map(|r| r.last_seen);
        let frame = encode_frame(&ServerEvent::Presence(PresencePayload {
            id: identity.id.clone(),
            username: identity.username.clone(),
            is_online: online,
            last_online,
        }))?;

        let mut sockets: Vec<SocketId> = self
            .presence
            .live_sockets_for(
                peers
                    .iter()
                    .map(|p| p.id.as_str())
                    .filter(|id| *id != identity.id),
            )
            .await
            .into_iter()
            .map(|(_, socket)| socket)
            .collect();
        sockets.sort_unstable();
        sockets.dedup();

        let notified = self.hub.send_many(&sockets, &frame).await;
        log::debug!(
            "Presence of {} ({}) sent to {notified}/{} peers",
            identity.id,
            if online { "online" } else { "offline" },
            peers.len()
        );
        Ok(notified)
    }

    // ─── Active ──────────────────────────────────────────────────

    /// Decode one inbound text frame and handle it.
    ///
    /// Shape errors are answered with `chat:error` on this connection
    /// only; unknown events and undecodable frames are logged and dropped.
    pub async fn handle_frame(&self, conn: &mut ActiveConnection, text: &str) {
        match ClientEvent::decode(text) {
            Ok(event) => self.handle(conn, event).await,
            Err(err) => match err.client_message() {
                Some(message) => {
                    self.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Rejected frame from socket {}: {err}", conn.socket_id);
                    self.send_error(conn.socket_id, &message).await;
                }
                None => log::warn!("Ignoring frame from socket {}: {err}", conn.socket_id),
            },
        }
    }

    /// Handle a decoded inbound event.
    pub async fn handle(&self, conn: &mut ActiveConnection, event: ClientEvent) {
        let name = event.name();
        let is_message = matches!(event, ClientEvent::Message { .. });

        let result = match event {
            ClientEvent::Join(room) => self.join(conn, room).await,
            ClientEvent::Message { room, content } => self.send_message(conn, room, content).await,
        };

        let Err(err) = result else {
            return;
        };

        let message = match &err {
            ChatError::Protocol(protocol) => {
                self.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
                protocol
                    .client_message()
                    .unwrap_or_else(|| INTERNAL_ERROR_MESSAGE.to_string())
            }
            _ => {
                log::error!("{name} from socket {} failed: {err}", conn.socket_id);
                if is_message {
                    self.stats.messages_failed.fetch_add(1, Ordering::Relaxed);
                    SEND_FAILED_MESSAGE.to_string()
                } else {
                    INTERNAL_ERROR_MESSAGE.to_string()
                }
            }
        };
        self.send_error(conn.socket_id, &message).await;
    }

    /// Join a room and deliver its recent history to this connection.
    ///
    /// If the history cannot be fetched the join is undone.
    async fn join(&self, conn: &mut ActiveConnection, room: RoomDescriptor) -> Result<(), ChatError> {
        if !room.is_valid() {
            return Err(ProtocolError::InvalidRoom.into());
        }

        let room_id = room::resolve(&room, &conn.identity.id);
        let newly_joined = self.rooms.join(&room_id, conn.socket_id).await;

        let query = HistoryQuery {
            room_key: room_id.clone(),
            limit: self.config.history_page_size,
        };
        let history = match self
            .call(MESSAGE_STORE, self.collaborators.messages.history(&query))
            .await
        {
            Ok(history) => history,
            Err(e) => {
                if newly_joined {
                    self.rooms.leave(&room_id, conn.socket_id).await;
                }
                return Err(e);
            }
        };
        conn.joined.insert(room_id.clone());

        let page = newest_first(history, self.config.history_page_size);
        log::debug!(
            "Socket {} joined room {room_id} ({} messages of history)",
            conn.socket_id,
            page.len()
        );
        self.send_event(conn.socket_id, &ServerEvent::History(page)).await
    }

    /// Persist a message, then deliver it to every member of its room.
    async fn send_message(
        &self,
        conn: &ActiveConnection,
        room: RoomDescriptor,
        content: String,
    ) -> Result<(), ChatError> {
        if content.is_empty() || !room.is_valid() {
            return Err(ProtocolError::InvalidMessage.into());
        }

        let room_id = room::resolve(&room, &conn.identity.id);
        let message = NewChatMessage {
            id: Uuid::new_v4().to_string(),
            content,
            sender: conn.identity.clone(),
            room_key: room_id.clone(),
            created_at: Utc::now().trunc_subsecs(3),
        };

        // Nothing is broadcast unless the append succeeded.
        let stored = self
            .call(MESSAGE_STORE, self.collaborators.messages.append(message))
            .await?;

        let frame = encode_frame(&ServerEvent::Message(stored.to_payload()))?;
        let delivered = self.rooms.fan_out(&self.hub, &room_id, &frame).await;
        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Message {} from {} relayed to {delivered} sockets in {room_id}",
            stored.id,
            conn.identity.id
        );
        Ok(())
    }

    // ─── Active → Disconnected ───────────────────────────────────

    /// Tear down a connection: drop its memberships, mark its user
    /// offline and tell the user's mutual peers.
    pub async fn disconnect(&self, conn: ActiveConnection) {
        let ActiveConnection {
            socket_id,
            identity,
            joined,
            ..
        } = conn;

        self.rooms.leave_all(&joined, socket_id).await;
        self.hub.unregister(socket_id).await;

        let went_offline = self.presence.set_offline(&identity.id).await;
        log::info!(
            "User {} ({}) disconnected from socket {socket_id}",
            identity.username,
            identity.id
        );

        if let Err(e) = self.announce(&identity, false, went_offline).await {
            log::error!("Presence withdrawal for {} failed: {e}", identity.id);
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────

    async fn send_event(&self, socket_id: SocketId, event: &ServerEvent) -> Result<(), ChatError> {
        let frame = encode_frame(event)?;
        self.hub.send(socket_id, frame).await;
        Ok(())
    }

    async fn send_error(&self, socket_id: SocketId, message: &str) {
        if let Err(e) = self.send_event(socket_id, &ServerEvent::error(message)).await {
            log::error!("Failed to encode error for socket {socket_id}: {e}");
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub async fn stats(&self) -> EngineStats {
        let hub = self.hub.stats().await;
        EngineStats {
            connections_accepted: self.stats.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.stats.connections_rejected.load(Ordering::Relaxed),
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            messages_failed: self.stats.messages_failed.load(Ordering::Relaxed),
            validation_errors: self.stats.validation_errors.load(Ordering::Relaxed),
            frames_dropped: hub.messages_dropped,
            active_connections: hub.active_connections,
            active_rooms: self.rooms.room_count().await,
            online_users: self.presence.online_count().await,
        }
    }
}

fn encode_frame(event: &ServerEvent) -> Result<Frame, ChatError> {
    Ok(Frame::from(event.encode()?))
}

/// Order a history page newest first and cap it at `limit`.
fn newest_first(mut history: Vec<StoredMessage>, limit: usize) -> Vec<ChatMessagePayload> {
    history.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    history.truncate(limit);
    history.iter().map(StoredMessage::to_payload).collect()
}
