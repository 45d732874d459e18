//! Per-connection session task
//!
//! A session authenticates its connection, then classifies every line the
//! client sends: commands are answered directly, private messages are
//! checked and routed, everything else becomes a chat envelope on the
//! inbound queue. When the session ends for any reason, including a panic,
//! its connection is handed to the unregister queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::auth;
use super::lifecycle::Shutdown;
use super::registry::ConnectionRegistry;
use crate::error::{ChatError, Result};
use crate::protocol::messages::{Envelope, ReplyKind};
use crate::store::{CredentialStore, DurableQueue};
use crate::transport::connection::{Connection, SessionReader};

const HELP_TEXT: &str = "Available commands:
/list          show online users
/history, /h   show recent chat history
/rank          show the most active users
/help          show this help
/exit          leave the chat
@name message  send a private message";

/// How long a session waits at shutdown for the server to close its
/// connection
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything a session task needs, shared by all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
    pub queue: Arc<dyn DurableQueue>,
    pub inbound: mpsc::Sender<Envelope>,
    pub unregister: mpsc::Sender<Arc<Connection>>,
    pub shutdown: Shutdown,
    pub history_count: usize,
    pub rank_count: usize,
}

impl SessionContext {
    /// Read the next line from the client, giving up on shutdown
    pub async fn recv(&self, conn: &Connection, reader: &mut SessionReader) -> Result<String> {
        tokio::select! {
            _ = self.shutdown.triggered() => Err(ChatError::Closed),
            line = conn.recv(reader) => line,
        }
    }

    /// Push an envelope onto the inbound queue
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.triggered() => Err(ChatError::Closed),
            sent = self.inbound.send(envelope) => sent.map_err(|_| ChatError::Closed),
        }
    }

    /// Hand a finished connection to the unregister handler.
    ///
    /// During shutdown the server notifies and closes registered
    /// connections itself; a connection nobody closes within
    /// [`SHUTDOWN_GRACE`] was never registered and is told here.
    pub async fn release(&self, conn: &Arc<Connection>) {
        if !self.shutdown.is_triggered() {
            let sent = tokio::select! {
                _ = self.shutdown.triggered() => None,
                sent = self.unregister.send(Arc::clone(conn)) => Some(sent),
            };
            match sent {
                Some(Ok(())) => return,
                Some(Err(_)) => {
                    self.registry.remove(conn).await;
                    return;
                }
                None => {}
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, conn.closed()).await.is_ok() {
            return;
        }
        let notice = conn.reply(ReplyKind::Shutdown, "Server is shutting down");
        if !matches!(tokio::time::timeout(SHUTDOWN_GRACE, notice).await, Ok(Ok(()))) {
            debug!(conn_id = conn.id(), "shutdown notice not delivered");
        }
        conn.close().await;
    }
}

// =============================================================================
// Classification
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Help,
    History,
    Rank,
    Exit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let word = line.split_whitespace().next().unwrap_or(line);
        match word {
            "/list" => Command::List,
            "/help" => Command::Help,
            "/history" | "/h" => Command::History,
            "/rank" => Command::Rank,
            "/exit" => Command::Exit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// What a trimmed client line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    Empty,
    Command(Command),
    Private { target: &'a str, body: &'a str },
    MalformedPrivate,
    Chat(&'a str),
}

pub fn classify(line: &str) -> Inbound<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Inbound::Empty;
    }
    if line.starts_with('/') {
        return Inbound::Command(Command::parse(line));
    }
    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((target, body)) if !target.is_empty() && !body.trim().is_empty() => {
                Inbound::Private {
                    target,
                    body: body.trim(),
                }
            }
            _ => Inbound::MalformedPrivate,
        };
    }
    Inbound::Chat(line)
}

// =============================================================================
// Session task
// =============================================================================

/// Spawn the task that owns `conn` for its whole lifetime
pub fn spawn_session(ctx: SessionContext, conn: Arc<Connection>, reader: SessionReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(run_session(&ctx, &conn, reader))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => debug!(conn_id = conn.id(), "session finished"),
            Ok(Err(e)) if e.is_transport() => {
                debug!(conn_id = conn.id(), peer = %conn.peer(), "session ended: {}", e)
            }
            Ok(Err(e)) => warn!(conn_id = conn.id(), peer = %conn.peer(), "session failed: {}", e),
            Err(_) => error!(conn_id = conn.id(), peer = %conn.peer(), "session panicked"),
        }

        ctx.release(&conn).await;
    })
}

async fn run_session(ctx: &SessionContext, conn: &Arc<Connection>, mut reader: SessionReader) -> Result<()> {
    let name = auth::authenticate(ctx, conn, &mut reader).await?;
    chat_loop(ctx, conn, &mut reader, &name).await
}

async fn chat_loop(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    reader: &mut SessionReader,
    name: &str,
) -> Result<()> {
    loop {
        let line = ctx.recv(conn, reader).await?;

        match classify(&line) {
            Inbound::Empty => {}
            Inbound::Command(Command::Exit) => {
                info!(conn_id = conn.id(), name = %name, "session left");
                conn.reply(ReplyKind::Command, "Goodbye").await?;
                return Ok(());
            }
            Inbound::Command(command) => run_command(ctx, conn, command).await?,
            Inbound::MalformedPrivate => {
                conn.reply(ReplyKind::Rejected, "Private message format: @name message")
                    .await?;
            }
            Inbound::Private { target, body } => {
                send_private(ctx, conn, name, target, body).await?;
            }
            Inbound::Chat(body) => {
                ctx.submit(Envelope::chat(name, conn.id(), body)).await?;
            }
        }
    }
}

/// Private messages are checked here so a bad target never enters the
/// pipeline
async fn send_private(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    name: &str,
    target: &str,
    body: &str,
) -> Result<()> {
    if target == name {
        return conn
            .reply(ReplyKind::Rejected, "You cannot send a private message to yourself")
            .await;
    }
    if !ctx.registry.is_taken(target).await {
        return conn
            .reply(ReplyKind::Rejected, format!("'{}' is not online", target))
            .await;
    }
    ctx.submit(Envelope::private(name, conn.id(), target, body)).await
}

async fn run_command(ctx: &SessionContext, conn: &Arc<Connection>, command: Command) -> Result<()> {
    let text = match command {
        Command::List => {
            let names = ctx.registry.list_names().await;
            if names.is_empty() {
                "Online: none".to_string()
            } else {
                format!("Online ({}): {}", names.len(), names.join(", "))
            }
        }
        Command::Help => HELP_TEXT.to_string(),
        Command::History => match ctx.queue.recent_history(ctx.history_count).await {
            Ok(lines) if lines.is_empty() => "No chat history yet".to_string(),
            Ok(lines) => format!(
                "--- Last {} messages ---\n{}\n--- End of history ---",
                lines.len(),
                lines.join("\n")
            ),
            Err(e) => {
                if ctx.queue.is_available() {
                    warn!(conn_id = conn.id(), "history query failed: {}", e);
                }
                "History is unavailable".to_string()
            }
        },
        Command::Rank => match ctx.queue.top_active(ctx.rank_count).await {
            Ok(lines) if lines.is_empty() => "No activity yet".to_string(),
            Ok(lines) => format!(
                "--- Top {} active users ---\n{}\n--- End of ranking ---",
                lines.len(),
                lines.join("\n")
            ),
            Err(e) => {
                if ctx.queue.is_available() {
                    warn!(conn_id = conn.id(), "rank query failed: {}", e);
                }
                "Ranking is unavailable".to_string()
            }
        },
        Command::Exit => "Goodbye".to_string(),
        Command::Unknown(word) => {
            debug!(conn_id = conn.id(), "unknown command {}", word);
            "Unknown command, use /help".to_string()
        }
    };
    conn.reply(ReplyKind::Command, text).await
}
