//! WebSocket chat client.
//!
//! Used by the integration suites and for poking a running server. A
//! background reader task decodes inbound frames into [`ServerEvent`]s;
//! outbound events are written directly.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::collaborators::TOKEN_QUERY_PARAM;
use crate::error::ChatError;
use crate::protocol::{ClientEvent, RoomDescriptor, ServerEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The chat client.
pub struct ChatClient {
    sink: WsSink,
    /// Decoded events from the reader task
    events: mpsc::Receiver<ServerEvent>,
    state: Arc<RwLock<ConnectionState>>,
    /// Close frame received from the server, if any
    close_frame: Arc<RwLock<Option<CloseFrame>>>,
}

impl ChatClient {
    /// Connect to a server URL such as `ws://127.0.0.1:9090/?token=abc`.
    pub async fn connect(url: &str) -> Result<Self, ChatError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (sink, mut stream) = ws_stream.split();

        let (event_tx, events) = mpsc::channel(256);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let close_frame = Arc::new(RwLock::new(None));

        let reader_state = state.clone();
        let reader_close = close_frame.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        log::debug!("Server closed connection: {frame:?}");
                        *reader_close.write().await = frame;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Connection read error: {e}");
                        break;
                    }
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            sink,
            events,
            state,
            close_frame,
        })
    }

    /// Connect to `base_url` presenting `token` as the session.
    pub async fn connect_with_token(base_url: &str, token: &str) -> Result<Self, ChatError> {
        Self::connect(&format!("{base_url}/?{TOKEN_QUERY_PARAM}={token}")).await
    }

    /// Send a client event.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ChatError> {
        let text = event.encode()?;
        self.send_raw(&text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ChatError> {
        self.sink.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn join(&mut self, room: RoomDescriptor) -> Result<(), ChatError> {
        self.send(&ClientEvent::Join(room)).await
    }

    pub async fn send_message(
        &mut self,
        room: RoomDescriptor,
        content: impl Into<String>,
    ) -> Result<(), ChatError> {
        self.send(&ClientEvent::Message {
            room,
            content: content.into(),
        })
        .await
    }

    /// Next event from the server, or `None` if nothing arrives within
    /// `wait` or the connection is gone.
    pub async fn next_event(&mut self, wait: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(wait, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the first event matching `pred`, discarding the others.
    pub async fn wait_for<P>(&mut self, wait: Duration, mut pred: P) -> Option<ServerEvent>
    where
        P: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event(remaining).await?;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close frame sent by the server, once the connection has ended.
    pub async fn close_frame(&self) -> Option<CloseFrame> {
        self.close_frame.read().await.clone()
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<(), ChatError> {
        self.sink.send(Message::Close(None)).await?;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }
}
