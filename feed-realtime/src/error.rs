//! Error types of the real-time layer.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Failure reported by an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollaboratorError {
    pub fn unavailable(collaborator: &'static str, reason: impl Into<String>) -> Self {
        CollaboratorError::Unavailable {
            collaborator,
            reason: reason.into(),
        }
    }
}

/// A configuration variable that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Errors raised while serving a chat connection.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The session store did not resolve an identity for the handshake.
    #[error("unauthorized connection")]
    Unauthorized,
    #[error("{collaborator} call timed out after {after:?}")]
    Timeout {
        collaborator: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the error came from a collaborator call (failed or timed out).
    pub fn is_collaborator_fault(&self) -> bool {
        matches!(self, ChatError::Timeout { .. } | ChatError::Collaborator(_))
    }
}
