//! Error type shared by the server, the stores and the wire protocol

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Everything that can go wrong while serving a client
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Socket read/write failures; terminal for the affected connection
    #[error("Network error: {0}")]
    Network(String),
    /// Malformed frames or payloads
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Credential store or durable queue failures
    #[error("Store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(String),
    /// The connection was closed locally or the server is shutting down
    #[error("Connection closed")]
    Closed,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn store<T: Into<String>>(msg: T) -> Self {
        ChatError::Store(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }

    /// Whether this error ends the connection it happened on
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::Protocol(_) | ChatError::Closed
        )
    }
}

impl From<io::Error> for ChatError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData => ChatError::Protocol(err.to_string()),
            _ => ChatError::Network(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Protocol(format!("malformed message: {}", err))
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Store(format!("SQLite error: {}", err))
    }
}

impl From<rusqlite_migration::Error> for ChatError {
    fn from(err: rusqlite_migration::Error) -> Self {
        ChatError::Store(format!("Migration error: {}", err))
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::Internal(format!("Task join error: {}", err))
    }
}
