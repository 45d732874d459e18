//! Protocol message types for the chat system
//!
//! Clients send raw text frames. The server answers with JSON-encoded
//! [`ServerMessage`]s whose [`ReplyKind`] tells the client what happened,
//! so clients never have to match on display text.

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::error::Result;

/// Process-unique connection identifier
pub type ConnId = u64;

/// Sender name used for server-generated envelopes
pub const SYSTEM_SENDER: &str = "[system]";

// =============================================================================
// Server -> client replies
// =============================================================================

/// Outcome tag carried by every server message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Main menu: choose login or register
    Menu,
    /// Waiting for a name or password
    Prompt,
    /// Input failed validation; the current step repeats
    Invalid,
    /// The chosen name already has a live session
    NameOnline,
    /// Login attempted with an unknown name; back to menu
    NotRegistered,
    /// Registration attempted with a known name; back to menu
    AlreadyRegistered,
    /// Wrong password, another attempt allowed
    PasswordRejected,
    /// Password attempts exhausted; back to name entry
    TooManyAttempts,
    /// Registration succeeded; back to menu
    Registered,
    /// Registration could not be stored; back to menu
    RegistrationFailed,
    /// Credential store failure; the connection will be closed
    StoreUnavailable,
    /// Login succeeded, session is now in chat
    Welcome,
    /// Broadcast chat line
    Chat,
    /// Private message, either received or a send confirmation
    Private,
    /// Server announcement
    System,
    /// Reply to a slash command
    Command,
    /// Chat input refused (bad private message target, etc.)
    Rejected,
    /// Server is going away
    Shutdown,
}

impl ReplyKind {
    /// Whether the client is back at the main menu after this reply
    pub fn returns_to_menu(&self) -> bool {
        matches!(
            self,
            ReplyKind::NotRegistered
                | ReplyKind::AlreadyRegistered
                | ReplyKind::Registered
                | ReplyKind::RegistrationFailed
        )
    }

    /// Whether the connection is about to be closed by the server
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyKind::StoreUnavailable | ReplyKind::Shutdown)
    }
}

/// A single server -> client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub kind: ReplyKind,
    pub text: String,
}

impl ServerMessage {
    pub fn new(kind: ReplyKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Encode into a wire frame
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(serde_json::to_vec(self)?))
    }

    /// Decode from a wire frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

// =============================================================================
// Routing envelopes
// =============================================================================

/// Routing class of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Private,
    System,
}

/// The unit passed through the routing pipeline. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: String,
    origin: Option<ConnId>,
    body: String,
    kind: MessageKind,
    target: Option<String>,
}

impl Envelope {
    /// Chat line typed by an authenticated session
    pub fn chat(sender: impl Into<String>, origin: ConnId, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            origin: Some(origin),
            body: body.into(),
            kind: MessageKind::Chat,
            target: None,
        }
    }

    /// Chat line re-delivered from the durable queue; it has no live origin
    pub fn replayed(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            origin: None,
            body: body.into(),
            kind: MessageKind::Chat,
            target: None,
        }
    }

    /// Private message from `sender` to `target`
    pub fn private(
        sender: impl Into<String>,
        origin: ConnId,
        target: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            origin: Some(origin),
            body: body.into(),
            kind: MessageKind::Private,
            target: Some(target.into()),
        }
    }

    /// Server announcement
    pub fn system(body: impl Into<String>) -> Self {
        Self {
            sender: SYSTEM_SENDER.to_string(),
            origin: None,
            body: body.into(),
            kind: MessageKind::System,
            target: None,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn origin(&self) -> Option<ConnId> {
        self.origin
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Line shown to every session for chat and system envelopes
    pub fn broadcast_line(&self) -> ServerMessage {
        match self.kind {
            MessageKind::System => ServerMessage::new(ReplyKind::System, self.body.clone()),
            _ => ServerMessage::new(
                ReplyKind::Chat,
                format!("[{}]: {}", self.sender, self.body),
            ),
        }
    }

    /// Line delivered to the recipient of a private message
    pub fn private_line(&self) -> ServerMessage {
        ServerMessage::new(
            ReplyKind::Private,
            format!("[private from {}]: {}", self.sender, self.body),
        )
    }

    /// Confirmation delivered back to the sender of a private message
    pub fn private_receipt(&self) -> ServerMessage {
        ServerMessage::new(
            ReplyKind::Private,
            format!(
                "[private to {}]: {}",
                self.target.as_deref().unwrap_or_default(),
                self.body
            ),
        )
    }
}
