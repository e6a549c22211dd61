//! External collaborators of the chat layer.
//!
//! The engine talks to four outside systems, each behind an async trait:
//!
//! | Trait | Answers |
//! |-------|---------|
//! | [`SessionStore`] | who is on the other end of this handshake |
//! | [`ConnectionGraph`] | which users are mutually connected to a user |
//! | [`MessageStore`](crate::storage::MessageStore) | append / page chat history |
//! | [`PresenceRepository`] | durable online flag of a user |
//!
//! The in-memory implementations below back the binary's fixture mode
//! and the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::error::CollaboratorError;
use crate::protocol::Identity;
use crate::storage::{MemoryMessageStore, MessageStore};

/// Query parameter carrying a session token.
pub const TOKEN_QUERY_PARAM: &str = "token";
/// Cookie carrying a session token.
pub const SESSION_COOKIE: &str = "session";

/// What the session store sees of an inbound connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

impl Handshake {
    /// Capture the parts of a WebSocket upgrade request the session store needs.
    pub fn from_request(request: &Request) -> Self {
        let uri = request.uri();
        let query = uri.query().map(parse_query).unwrap_or_default();
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Self {
            path: uri.path().to_string(),
            query,
            headers,
        }
    }

    /// Handshake carrying a token in the query string.
    pub fn with_token(token: impl Into<String>) -> Self {
        let mut handshake = Self::default();
        handshake
            .query
            .insert(TOKEN_QUERY_PARAM.to_string(), token.into());
        handshake
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Session token from `?token=`, `Authorization: Bearer`, or the session cookie.
    pub fn token(&self) -> Option<&str> {
        if let Some(token) = self.query.get(TOKEN_QUERY_PARAM) {
            return Some(token.as_str());
        }
        if let Some(token) = self
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return Some(token.trim());
        }
        self.header("cookie").and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == SESSION_COOKIE).then_some(value)
            })
        })
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Decode `%XX` escapes. `+` is kept as is; malformed escapes pass through.
fn percent_decode(input: &str) -> String {
    if !input.contains('%') {
        return input.to_string();
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = input
                .get(i + 1..i + 3)
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolves an inbound connection to an authenticated identity.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` rejects the connection.
    async fn resolve(&self, handshake: &Handshake) -> Result<Option<Identity>, CollaboratorError>;
}

/// Mutual-connection lookups.
#[async_trait]
pub trait ConnectionGraph: Send + Sync {
    /// Users with an active, mutually accepted connection to `user_id`.
    async fn active_peers(&self, user_id: &str) -> Result<Vec<Identity>, CollaboratorError>;
}

/// Durable per-user presence flag.
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn set_online_flag(&self, user_id: &str, online: bool) -> Result<(), CollaboratorError>;
}

/// The set of collaborators handed to the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub graph: Arc<dyn ConnectionGraph>,
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn PresenceRepository>,
}

impl Collaborators {
    /// Fresh, empty in-memory collaborators.
    pub fn in_memory() -> Self {
        MemoryCollaborators::new().collaborators()
    }
}

// ─── In-memory implementations ───────────────────────────────────

/// Token → identity table.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Identity>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.sessions.write().await.insert(token.into(), identity);
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn resolve(&self, handshake: &Handshake) -> Result<Option<Identity>, CollaboratorError> {
        let Some(token) = handshake.token() else {
            return Ok(None);
        };
        Ok(self.sessions.read().await.get(token).cloned())
    }
}

/// Relationship status between two users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Rejected,
    Cancelled,
    Blocked,
}

#[derive(Debug, Default)]
struct GraphState {
    users: HashMap<String, Identity>,
    /// Keyed by the byte-ordered user pair.
    edges: HashMap<(String, String), ConnectionStatus>,
}

fn edge_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Undirected relationship graph with per-edge status.
#[derive(Debug, Default)]
pub struct MemoryConnectionGraph {
    state: RwLock<GraphState>,
}

impl MemoryConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, identity: Identity) {
        self.state
            .write()
            .await
            .users
            .insert(identity.id.clone(), identity);
    }

    /// Create or update the relationship between `a` and `b`.
    pub async fn set_status(&self, a: &str, b: &str, status: ConnectionStatus) {
        self.state.write().await.edges.insert(edge_key(a, b), status);
    }

    pub async fn status(&self, a: &str, b: &str) -> Option<ConnectionStatus> {
        self.state.read().await.edges.get(&edge_key(a, b)).copied()
    }
}

#[async_trait]
impl ConnectionGraph for MemoryConnectionGraph {
    async fn active_peers(&self, user_id: &str) -> Result<Vec<Identity>, CollaboratorError> {
        let state = self.state.read().await;
        let mut peers: Vec<Identity> = state
            .edges
            .iter()
            .filter(|(_, status)| **status == ConnectionStatus::Active)
            .filter_map(|((a, b), _)| {
                let other = if a == user_id {
                    b
                } else if b == user_id {
                    a
                } else {
                    return None;
                };
                if other == user_id {
                    return None;
                }
                Some(
                    state
                        .users
                        .get(other)
                        .cloned()
                        .unwrap_or_else(|| Identity::new(other.clone(), other.clone())),
                )
            })
            .collect();
        peers.sort_by(|x, y| x.id.cmp(&y.id));
        Ok(peers)
    }
}

/// Durable presence columns of a user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserPresence {
    pub is_online: bool,
    pub last_online: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryPresenceRepository {
    users: RwLock<HashMap<String, UserPresence>>,
}

impl MemoryPresenceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn presence(&self, user_id: &str) -> Option<UserPresence> {
        self.users.read().await.get(user_id).copied()
    }
}

#[async_trait]
impl PresenceRepository for MemoryPresenceRepository {
    async fn set_online_flag(&self, user_id: &str, online: bool) -> Result<(), CollaboratorError> {
        let mut users = self.users.write().await;
        let entry = users.entry(user_id.to_string()).or_default();
        entry.is_online = online;
        entry.last_online = Some(Utc::now());
        Ok(())
    }
}

// ─── Fixtures ────────────────────────────────────────────────────

/// A user seeded into the in-memory collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureUser {
    pub id: String,
    pub username: String,
    /// Session token the user connects with
    pub token: String,
}

/// A relationship seeded into the in-memory connection graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConnection {
    pub users: (String, String),
    pub status: ConnectionStatus,
}

/// Seed data for running without the real backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub users: Vec<FixtureUser>,
    #[serde(default)]
    pub connections: Vec<FixtureConnection>,
}

impl Fixtures {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// In-memory collaborators with typed handles for seeding.
#[derive(Debug, Clone, Default)]
pub struct MemoryCollaborators {
    pub sessions: Arc<MemorySessionStore>,
    pub graph: Arc<MemoryConnectionGraph>,
    pub messages: Arc<MemoryMessageStore>,
    pub users: Arc<MemoryPresenceRepository>,
}

impl MemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `identity` known to the graph and reachable through `token`.
    pub async fn add_user(&self, token: impl Into<String>, identity: Identity) {
        self.graph.add_user(identity.clone()).await;
        self.sessions.insert(token, identity).await;
    }

    pub async fn load_fixtures(&self, fixtures: &Fixtures) {
        for user in &fixtures.users {
            self.add_user(
                user.token.clone(),
                Identity::new(user.id.clone(), user.username.clone()),
            )
            .await;
        }
        for connection in &fixtures.connections {
            let (a, b) = &connection.users;
            self.graph.set_status(a, b, connection.status).await;
        }
        log::info!(
            "Loaded {} users and {} connections from fixtures",
            fixtures.users.len(),
            fixtures.connections.len()
        );
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with(self.messages.clone())
    }

    /// Same collaborators, with messages kept in `messages` instead.
    pub fn collaborators_with(&self, messages: Arc<dyn MessageStore>) -> Collaborators {
        Collaborators {
            sessions: self.sessions.clone(),
            graph: self.graph.clone(),
            messages,
            users: self.users.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    #[test]
    fn test_handshake_from_request() {
        let request = http::Request::builder()
            .uri("ws://localhost:9090/chat?token=abc&x=1")
            .header("Cookie", "theme=dark; session=xyz")
            .body(())
            .unwrap();
        let handshake = Handshake::from_request(&request);

        assert_eq!(handshake.path, "/chat");
        assert_eq!(handshake.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(handshake.header("COOKIE"), Some("theme=dark; session=xyz"));
        assert_eq!(handshake.token(), Some("abc"));
    }

    #[test]
    fn test_query_values_are_percent_decoded() {
        let request = http::Request::builder()
            .uri("ws://localhost:9090/?token=a%2Bb%3D%3D&name=caf%C3%A9&raw=a+b")
            .body(())
            .unwrap();
        let handshake = Handshake::from_request(&request);

        assert_eq!(handshake.token(), Some("a+b=="));
        assert_eq!(handshake.query.get("name").map(String::as_str), Some("café"));
        assert_eq!(handshake.query.get("raw").map(String::as_str), Some("a+b"));
    }

    #[test]
    fn test_percent_decode_malformed_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz%4"), "%zz%4");
        assert_eq!(percent_decode("%+1"), "%+1");
        assert_eq!(percent_decode("%41%42c"), "ABc");
        assert_eq!(percent_decode("plain"), "plain");
    }

    #[test]
    fn test_token_sources() {
        let mut handshake = Handshake::default();
        assert_eq!(handshake.token(), None);

        handshake
            .headers
            .insert("cookie".into(), "theme=dark; session=from-cookie".into());
        assert_eq!(handshake.token(), Some("from-cookie"));

        handshake
            .headers
            .insert("authorization".into(), "Bearer from-header".into());
        assert_eq!(handshake.token(), Some("from-header"));

        handshake.query.insert("token".into(), "from-query".into());
        assert_eq!(handshake.token(), Some("from-query"));
    }

    #[tokio::test]
    async fn test_memory_session_store() {
        let store = MemorySessionStore::new();
        store.insert("t1", Identity::new("u1", "alice")).await;

        let who = store.resolve(&Handshake::with_token("t1")).await.unwrap();
        assert_eq!(who, Some(Identity::new("u1", "alice")));

        assert!(store.resolve(&Handshake::with_token("nope")).await.unwrap().is_none());
        assert!(store.resolve(&Handshake::default()).await.unwrap().is_none());

        assert!(store.revoke("t1").await);
        assert!(store.resolve(&Handshake::with_token("t1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_graph_active_peers_only() {
        let graph = MemoryConnectionGraph::new();
        graph.add_user(Identity::new("u1", "alice")).await;
        graph.add_user(Identity::new("u2", "bob")).await;
        graph.add_user(Identity::new("u3", "carol")).await;
        graph.add_user(Identity::new("u4", "dave")).await;

        graph.set_status("u1", "u2", ConnectionStatus::Active).await;
        graph.set_status("u3", "u1", ConnectionStatus::Active).await;
        graph.set_status("u1", "u4", ConnectionStatus::Pending).await;

        let peers = graph.active_peers("u1").await.unwrap();
        let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u3"]);

        let peers = graph.active_peers("u2").await.unwrap();
        assert_eq!(peers, vec![Identity::new("u1", "alice")]);

        assert!(graph.active_peers("u4").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_graph_status_update() {
        let graph = MemoryConnectionGraph::new();
        graph.set_status("u1", "u2", ConnectionStatus::Active).await;
        graph.set_status("u2", "u1", ConnectionStatus::Cancelled).await;

        assert_eq!(graph.status("u1", "u2").await, Some(ConnectionStatus::Cancelled));
        assert!(graph.active_peers("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_graph_unknown_user_falls_back_to_id() {
        let graph = MemoryConnectionGraph::new();
        graph.set_status("u1", "ghost", ConnectionStatus::Active).await;
        let peers = graph.active_peers("u1").await.unwrap();
        assert_eq!(peers, vec![Identity::new("ghost", "ghost")]);
    }

    #[tokio::test]
    async fn test_presence_repository() {
        let repo = MemoryPresenceRepository::new();
        assert!(repo.presence("u1").await.is_none());

        repo.set_online_flag("u1", true).await.unwrap();
        let p = repo.presence("u1").await.unwrap();
        assert!(p.is_online);
        assert!(p.last_online.is_some());

        repo.set_online_flag("u1", false).await.unwrap();
        assert!(!repo.presence("u1").await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_load_fixtures() {
        let fixtures = Fixtures::from_json(
            r#"{
                "users": [
                    { "id": "u1", "username": "alice", "token": "t-alice" },
                    { "id": "u2", "username": "bob", "token": "t-bob" }
                ],
                "connections": [
                    { "users": ["u1", "u2"], "status": "active" }
                ]
            }"#,
        )
        .unwrap();

        let memory = MemoryCollaborators::new();
        memory.load_fixtures(&fixtures).await;
        let collaborators = memory.collaborators();

        let who = collaborators
            .sessions
            .resolve(&Handshake::with_token("t-bob"))
            .await
            .unwrap();
        assert_eq!(who, Some(Identity::new("u2", "bob")));

        let peers = collaborators.graph.active_peers("u1").await.unwrap();
        assert_eq!(peers, vec![Identity::new("u2", "bob")]);
    }

    #[test]
    fn test_fixtures_sections_optional() {
        let fixtures = Fixtures::from_json("{}").unwrap();
        assert_eq!(fixtures, Fixtures::default());
        assert!(Fixtures::from_json(r#"{"connections":[{"users":["a","b"],"status":"friends"}]}"#).is_err());
    }
}
