//! Chat server: accept loop, stage wiring and orderly shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lifecycle::Shutdown;
use super::pipeline::{
    PendingConnection, run_admission, run_broadcaster, run_dispatcher, run_unregister,
};
use super::registry::ConnectionRegistry;
use super::session::SessionContext;
use crate::config::ServerConfig;
use crate::error::{ChatError, Result};
use crate::protocol::messages::ReplyKind;
use crate::store::{
    CredentialStore, DisabledQueue, DurableQueue, SqliteCredentialStore, SqliteQueue,
    spawn_consumer,
};
use crate::transport::connection::Connection;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);
const STAGE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP chat server
pub struct ChatServer {
    config: ServerConfig,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<dyn CredentialStore>,
    queue: Arc<dyn DurableQueue>,
    register_tx: mpsc::Sender<PendingConnection>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatServer {
    /// Open the stores under the configured data directory and bind.
    ///
    /// A credential store that cannot be opened is fatal; a durable queue
    /// that cannot be opened only disables history, ranking and replay.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            ChatError::config(format!(
                "cannot create data directory {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        let credentials = Arc::new(SqliteCredentialStore::open(&config.credentials_path())?);
        let queue = open_queue(&config).await;
        Self::with_stores(config, credentials, queue).await
    }

    /// Bind with caller-supplied stores
    pub async fn with_stores(
        config: ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        queue: Arc<dyn DurableQueue>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let queue = prepare_queue(queue).await;
        let shutdown = Shutdown::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
        let (register_tx, register_rx) = mpsc::channel(config.register_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.unregister_capacity);

        let registry = Arc::new(ConnectionRegistry::new(inbound_tx.clone(), shutdown.token()));

        let ctx = SessionContext {
            registry: Arc::clone(&registry),
            credentials: Arc::clone(&credentials),
            queue: Arc::clone(&queue),
            inbound: inbound_tx,
            unregister: unregister_tx.clone(),
            shutdown: shutdown.clone(),
            history_count: config.history_count,
            rank_count: config.rank_count,
        };

        let mut tasks = vec![
            tokio::spawn(run_dispatcher(
                inbound_rx,
                Arc::clone(&queue),
                broadcast_tx.clone(),
                shutdown.token(),
            )),
            tokio::spawn(run_broadcaster(
                broadcast_rx,
                Arc::clone(&registry),
                unregister_tx,
                shutdown.token(),
            )),
            tokio::spawn(run_unregister(
                unregister_rx,
                Arc::clone(&registry),
                shutdown.token(),
            )),
            tokio::spawn(run_admission(register_rx, ctx)),
        ];

        if queue.is_available() {
            for i in 1..=config.consumers {
                tasks.push(spawn_consumer(
                    Arc::clone(&queue),
                    format!("consumer-{}", i),
                    broadcast_tx.clone(),
                    shutdown.token(),
                ));
            }
        } else {
            warn!("durable queue unavailable, chat is broadcast directly");
        }

        info!(addr = %local_addr, "chat server listening");

        Ok(Self {
            config,
            listener: Mutex::new(Some(listener)),
            local_addr,
            registry,
            credentials,
            queue,
            register_tx,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Whether chat currently goes through the durable queue
    pub fn queue_enabled(&self) -> bool {
        self.queue.is_available()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Accept connections until shutdown. Can only be run once.
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ChatError::internal("accept loop already started"))?;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.triggered() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::select! {
                        _ = self.shutdown.triggered() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, "set_nodelay failed: {}", e);
            }
            let (conn, reader) = Connection::split(peer.to_string(), stream, self.config.max_frame_size);
            debug!(conn_id = conn.id(), peer = %peer, "connection accepted");

            let pending = PendingConnection {
                conn: Arc::clone(&conn),
                reader,
            };
            let admitted = tokio::select! {
                _ = self.shutdown.triggered() => false,
                sent = self.register_tx.send(pending) => sent.is_ok(),
            };
            if !admitted {
                conn.close().await;
                break;
            }
        }

        info!("accept loop stopped");
        Ok(())
    }

    /// Stop the server. Only the first call does anything; it returns
    /// `true`.
    ///
    /// Raises the shutdown signal, closes both stores, then empties the
    /// registry and tells every session the server is going away.
    pub async fn shutdown(&self) -> bool {
        if !self.shutdown.trigger() {
            return false;
        }
        info!("shutting down");

        self.credentials.close().await;
        self.queue.close().await;

        let sessions = self.registry.snapshot_and_clear().await;
        let notified = sessions.len();
        join_all(sessions.into_iter().map(|(name, conn)| async move {
            let notice = conn.reply(ReplyKind::Shutdown, "Server is shutting down");
            if tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, notice).await.is_err() {
                debug!(name = %name, "shutdown notice timed out");
            }
            conn.close().await;
        }))
        .await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if tokio::time::timeout(STAGE_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("stage did not stop in time, aborting");
                task.abort();
            }
        }

        info!(sessions = notified, "shutdown complete");
        true
    }
}

/// Open the configured durable queue, or a disabled one if that fails
async fn open_queue(config: &ServerConfig) -> Arc<dyn DurableQueue> {
    if config.no_queue {
        info!("durable queue disabled by configuration");
        return Arc::new(DisabledQueue);
    }

    let queue = match SqliteQueue::open(&config.queue_path(), config.queue_retention) {
        Ok(queue) => queue,
        Err(e) => {
            warn!("cannot open durable queue, running degraded: {}", e);
            return Arc::new(DisabledQueue);
        }
    };

    if config.reset_queue_on_start {
        if let Err(e) = queue.reset().await {
            warn!("failed to reset durable queue: {}", e);
        }
    }
    Arc::new(queue)
}

/// Make sure the consumer group exists; without it the queue is unusable
async fn prepare_queue(queue: Arc<dyn DurableQueue>) -> Arc<dyn DurableQueue> {
    if !queue.is_available() {
        return queue;
    }
    match queue.create_consumer_group().await {
        Ok(()) => queue,
        Err(e) => {
            warn!("cannot create consumer group, running degraded: {}", e);
            queue.close().await;
            Arc::new(DisabledQueue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_creates_data_dir_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().join("nested"),
            ..local_config()
        };

        let server = ChatServer::bind(config).await.unwrap();
        assert!(server.queue_enabled());
        assert!(dir.path().join("nested/users.db").exists());
        assert!(dir.path().join("nested/queue.db").exists());
        assert!(server.shutdown().await);
    }

    #[tokio::test]
    async fn test_no_queue_runs_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            no_queue: true,
            consumers: 0,
            ..local_config()
        };

        let server = ChatServer::bind(config).await.unwrap();
        assert!(!server.queue_enabled());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_queue_degrades_at_startup() {
        let queue = SqliteQueue::open_in_memory(10).unwrap();
        queue.close().await;

        let server = ChatServer::with_stores(
            local_config(),
            Arc::new(SqliteCredentialStore::open_in_memory().unwrap()),
            Arc::new(queue),
        )
        .await
        .unwrap();
        assert!(!server.queue_enabled());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_accepting() {
        let server = Arc::new(
            ChatServer::with_stores(
                local_config(),
                Arc::new(SqliteCredentialStore::open_in_memory().unwrap()),
                Arc::new(SqliteQueue::open_in_memory(10).unwrap()),
            )
            .await
            .unwrap(),
        );

        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        assert!(server.shutdown().await);
        assert!(!server.shutdown().await);
        assert!(server.is_shutdown());

        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.registry().online_count().await, 0);

        // Listener was dropped with the accept loop
        assert!(tokio::net::TcpStream::connect(server.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_twice_is_an_error() {
        let server = ChatServer::with_stores(
            local_config(),
            Arc::new(SqliteCredentialStore::open_in_memory().unwrap()),
            Arc::new(DisabledQueue),
        )
        .await
        .unwrap();

        server.shutdown().await;
        server.run().await.unwrap();
        assert!(matches!(server.run().await, Err(ChatError::Internal(_))));
    }
}
