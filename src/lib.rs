//! Multi-user chat server
//!
//! Clients speak length-prefixed UTF-8 frames over TCP. After logging in,
//! every line they send is routed through a small pipeline of tasks
//! connected by bounded queues. Chat is persisted to a durable queue and
//! replayed to everyone by consumer workers; when the queue is unavailable
//! it is broadcast directly instead.

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ChatError, Result};
pub use protocol::{Envelope, Frame, MessageKind, ReplyKind, ServerMessage};
pub use server::ChatServer;
pub use store::{CredentialStore, DisabledQueue, DurableQueue, SqliteCredentialStore, SqliteQueue};
