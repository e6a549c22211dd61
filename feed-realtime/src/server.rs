//! WebSocket chat server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                           ┌── SessionStore
//!            │   handshake ─► authenticate ├── ConnectionGraph
//! Client B ──┼── connection task ──────────┼── MessageStore (memory / RocksDB)
//!            │        │                    └── PresenceRepository
//! Client C ──┘        ▼
//!               FanOutEngine ── RoomManager ── ConnectionHub ──► outbound queues
//! ```
//!
//! Each connection runs as two tasks. The reader hands inbound WebSocket
//! frames to the engine one at a time; the writer drains the connection's
//! outbound queue into the socket in order, so a slow collaborator call on
//! the reader side never stalls delivery to that connection.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Frame;
use crate::collaborators::{Collaborators, Handshake};
use crate::engine::{EngineConfig, FanOutEngine};
use crate::error::{ChatError, ConfigError};

pub const ENV_BIND_ADDR: &str = "FEED_BIND_ADDR";
pub const ENV_HISTORY_PAGE_SIZE: &str = "FEED_HISTORY_PAGE_SIZE";
pub const ENV_OUTBOUND_CAPACITY: &str = "FEED_OUTBOUND_CAPACITY";
pub const ENV_COLLABORATOR_TIMEOUT_MS: &str = "FEED_COLLABORATOR_TIMEOUT_MS";
pub const ENV_STORAGE_PATH: &str = "FEED_STORAGE_PATH";
pub const ENV_FIXTURES_PATH: &str = "FEED_FIXTURES_PATH";

/// Close reason sent to connections without a valid session.
pub const UNAUTHORIZED_REASON: &str = "unauthorized";

/// Control frames (pongs) waiting for the writer task.
const CONTROL_QUEUE_CAPACITY: usize = 16;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Engine tuning
    pub engine: EngineConfig,
    /// RocksDB message store path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// JSON fixtures for the in-memory collaborators
    pub fixtures_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            engine: EngineConfig::default(),
            storage_path: None,
            fixtures_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `FEED_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_HISTORY_PAGE_SIZE) {
            config.engine.history_page_size = parse_var(ENV_HISTORY_PAGE_SIZE, value)?;
        }
        if let Some(value) = lookup(ENV_OUTBOUND_CAPACITY) {
            config.engine.outbound_capacity = parse_var(ENV_OUTBOUND_CAPACITY, value)?;
        }
        if let Some(value) = lookup(ENV_COLLABORATOR_TIMEOUT_MS) {
            config.engine.collaborator_timeout =
                Duration::from_millis(parse_var(ENV_COLLABORATOR_TIMEOUT_MS, value)?);
        }
        config.storage_path = lookup(ENV_STORAGE_PATH)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config.fixtures_path = lookup(ENV_FIXTURES_PATH)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { var, value })
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// The chat server.
pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    engine: Arc<FanOutEngine>,
    stats: Arc<AtomicServerStats>,
}

impl ChatServer {
    /// Bind the listener. Connections are accepted once [`run`](Self::run) is called.
    pub async fn bind(config: ServerConfig, collaborators: Collaborators) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let engine = Arc::new(FanOutEngine::new(config.engine.clone(), collaborators));
        Ok(Self {
            config,
            listener,
            engine,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the process ends.
    pub async fn run(&self) -> Result<(), ChatError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Connections already accepted keep running in their own tasks.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Chat server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let engine = self.engine.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, engine, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Serve a single WebSocket connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<FanOutEngine>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ChatError> {
        let mut handshake = Handshake::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                handshake = Handshake::from_request(request);
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let authenticated = match engine.authenticate(&handshake).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected connection from {addr}: {e}");
                let close = CloseFrame {
                    code: CloseCode::Policy,
                    reason: UNAUTHORIZED_REASON.into(),
                };
                if let Err(e) = ws_sender.send(Message::Close(Some(close))).await {
                    log::debug!("Failed to send close frame to {addr}: {e}");
                }
                return Ok(());
            }
        };

        let mut conn = engine.activate(authenticated).await;
        let Some(outbound) = conn.take_outbound() else {
            engine.disconnect(conn).await;
            return Ok(());
        };
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "WebSocket connection from {addr} active as socket {}",
            conn.socket_id()
        );

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let writer = tokio::spawn(Self::write_frames(
            ws_sender,
            outbound,
            control_rx,
            stats.clone(),
            addr,
        ));

        let result: Result<(), ChatError> = loop {
            let msg = tokio::select! {
                msg = ws_receiver.next() => msg,
                // The writer stopped; the socket is gone.
                _ = control_tx.closed() => break Ok(()),
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                    engine.handle_frame(&mut conn, text.as_str()).await;
                }

                Some(Ok(Message::Binary(data))) => {
                    log::warn!("Ignoring {}-byte binary frame from {addr}", data.len());
                }

                Some(Ok(Message::Ping(data))) => {
                    if control_tx.send(Message::Pong(data)).await.is_err() {
                        break Ok(());
                    }
                }

                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {addr}");
                    break Ok(());
                }

                Some(Err(e)) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break Ok(());
                }

                _ => {}
            }
        };

        // Unregistering closes the outbound queue; the writer flushes what
        // is left and exits.
        engine.disconnect(conn).await;
        drop(control_tx);
        if let Err(e) = writer.await {
            log::error!("Writer task for {addr} failed: {e}");
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Write queued frames and control messages to the socket until the
    /// outbound queue closes or a write fails.
    async fn write_frames(
        mut ws_sender: WsSink,
        mut outbound: mpsc::Receiver<Frame>,
        mut control: mpsc::Receiver<Message>,
        stats: Arc<AtomicServerStats>,
        addr: SocketAddr,
    ) {
        let mut control_open = true;
        loop {
            let (message, is_frame) = tokio::select! {
                biased;
                msg = control.recv(), if control_open => match msg {
                    Some(msg) => (msg, false),
                    None => {
                        control_open = false;
                        continue;
                    }
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => (Message::Text(frame.to_string().into()), true),
                    None => break,
                },
            };
            if let Err(e) = ws_sender.send(message).await {
                log::debug!("Stopped writing to {addr}: {e}");
                break;
            }
            if is_frame {
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The engine shared by all connection tasks.
    pub fn engine(&self) -> &Arc<FanOutEngine> {
        &self.engine
    }
}
