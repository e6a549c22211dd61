//! # feed-realtime: Presence and chat fan-out for the social feed
//!
//! Keeps a live WebSocket per signed-in user, tracks who is online, tells
//! mutually connected users when that changes, and relays chat messages
//! between the members of a room after persisting them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ChatClient  │ ◄─────────────────► │ ChatServer  │
//! │ (per user)  │     JSON events     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ FanOutEngine│
//!                                     └──────┬──────┘
//!              ┌──────────────┬──────────────┼──────────────┐
//!              ▼              ▼              ▼              ▼
//!      PresenceTracker   RoomManager   ConnectionHub   Collaborators
//!      (user → socket)   (room → set)  (socket → queue) (sessions, graph,
//!                                                        messages, users)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events (`chat:*`, `user:active`)
//! - [`room`]: canonical room ids
//! - [`presence`]: in-memory online state
//! - [`broadcast`]: room membership and per-connection outbound queues
//! - [`collaborators`]: session, relationship and presence backends
//! - [`storage`]: message persistence (memory, RocksDB)
//! - [`engine`]: connection life-cycle and fan-out
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod broadcast;
pub mod client;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, ConnectionHub, Frame, RoomManager, SocketId};
pub use client::{ChatClient, ConnectionState};
pub use collaborators::{
    Collaborators, ConnectionGraph, ConnectionStatus, Fixtures, Handshake, MemoryCollaborators,
    MemoryConnectionGraph, MemoryPresenceRepository, MemorySessionStore, PresenceRepository,
    SessionStore,
};
pub use engine::{ActiveConnection, Authenticated, EngineConfig, EngineStats, FanOutEngine};
pub use error::{ChatError, CollaboratorError, ConfigError};
pub use presence::{PresenceChange, PresenceRecord, PresenceTracker};
pub use protocol::{
    ChatMessagePayload, ClientEvent, Identity, PresencePayload, ProtocolError, RoomDescriptor,
    RoomKind, ServerEvent,
};
pub use server::{ChatServer, ServerConfig, ServerStats};
pub use storage::{
    HistoryQuery, MemoryMessageStore, MessageStore, NewChatMessage, RocksMessageStore,
    StoreConfig, StoreError, StoredMessage,
};
