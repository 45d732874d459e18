//! Connection handle shared between the session task and the routing stages
//!
//! The read half stays with the session task that owns the connection; the
//! write half lives behind a mutex in [`Connection`] so any stage can send a
//! frame. Closing cancels a token that both sides select on, which unblocks
//! a pending read or write.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::protocol::frame::FrameReader;
use crate::protocol::messages::{ConnId, ReplyKind, ServerMessage};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half used by session tasks
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Frame reader over the read half of a connection
pub type SessionReader = FrameReader<BoxedReader>;

/// Write side of a client connection plus its close signal
pub struct Connection {
    id: ConnId,
    peer: String,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
}

impl Connection {
    /// Wrap the write half of a stream
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            writer: Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
        })
    }

    /// Split a full-duplex stream into a connection handle and a session reader
    pub fn split<S>(peer: impl Into<String>, stream: S, max_frame_size: usize) -> (Arc<Self>, SessionReader)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let reader = FrameReader::new(Box::new(read) as BoxedReader, max_frame_size);
        (Self::new(peer, write), reader)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Send one message. Fails with [`ChatError::Closed`] once the
    /// connection is closed, including while waiting on a slow peer.
    pub async fn send(&self, message: &ServerMessage) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::Closed);
        }
        let bytes = message.to_frame()?.encode_to_bytes();

        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(ChatError::Closed),
            writer = self.writer.lock() => writer,
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(ChatError::Closed),
            written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => written.map_err(ChatError::from),
        }
    }

    /// Send a reply of the given kind
    pub async fn reply(&self, kind: ReplyKind, text: impl Into<String>) -> Result<()> {
        self.send(&ServerMessage::new(kind, text)).await
    }

    /// Read the next text frame from this connection's reader
    pub async fn recv(&self, reader: &mut SessionReader) -> Result<String> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ChatError::Closed),
            line = reader.read_text() => line.map_err(ChatError::from),
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // A sender stuck on a slow peer holds the lock; it observes the
        // cancellation and drops the writer on its own.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        debug!(conn_id = self.id, peer = %self.peer, "connection closed");
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
