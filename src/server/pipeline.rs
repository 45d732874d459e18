//! Singleton routing stages
//!
//! ```text
//! sessions ──inbound──▶ dispatcher ──chat──▶ durable queue ──▶ consumers ─┐
//!                          │  (private, system, failed enqueue)          │
//!                          └──────────────broadcast◀─────────────────────┘
//!                                             │
//!                                        broadcaster ──failed writes──▶ unregister
//! ```
//!
//! Every stage drains one bounded queue and stops on shutdown or when its
//! queue closes. A panic while handling one item is logged and the stage
//! moves on to the next.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::ConnectionRegistry;
use super::session::{SessionContext, spawn_session};
use crate::protocol::messages::{Envelope, MessageKind, ServerMessage};
use crate::store::DurableQueue;
use crate::transport::connection::{Connection, SessionReader};

/// An accepted connection waiting for its session task
pub struct PendingConnection {
    pub conn: Arc<Connection>,
    pub reader: SessionReader,
}

/// Receive the next item, or `None` on shutdown / closed queue
async fn next<T>(rx: &mut mpsc::Receiver<T>, shutdown: &CancellationToken) -> Option<T> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Send unless shutdown comes first. False if the item was not sent.
async fn forward<T>(tx: &mpsc::Sender<T>, item: T, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Route inbound envelopes: chat goes through the durable queue, private
/// and system envelopes (and chat the queue refused) go straight to the
/// broadcaster.
pub async fn run_dispatcher(
    mut inbound: mpsc::Receiver<Envelope>,
    queue: Arc<dyn DurableQueue>,
    broadcast: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    info!("dispatcher started");
    while let Some(envelope) = next(&mut inbound, &shutdown).await {
        match AssertUnwindSafe(dispatch(queue.as_ref(), &broadcast, envelope, &shutdown))
            .catch_unwind()
            .await
        {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => error!("dispatcher panicked on an envelope, continuing"),
        }
    }
    info!("dispatcher stopped");
}

async fn dispatch(
    queue: &dyn DurableQueue,
    broadcast: &mpsc::Sender<Envelope>,
    envelope: Envelope,
    shutdown: &CancellationToken,
) -> bool {
    if envelope.kind() == MessageKind::Chat {
        if let Err(e) = queue.increment_activity(envelope.sender()).await {
            if queue.is_available() {
                warn!(name = %envelope.sender(), "activity update failed: {}", e);
            }
        }

        match queue.enqueue_chat(&envelope).await {
            Ok(entry_id) => {
                debug!(entry_id, name = %envelope.sender(), "chat queued for replay");
                return true;
            }
            Err(e) => {
                if queue.is_available() {
                    warn!(name = %envelope.sender(), "enqueue failed, broadcasting directly: {}", e);
                } else {
                    debug!(name = %envelope.sender(), "queue disabled, broadcasting directly");
                }
            }
        }
    }

    forward(broadcast, envelope, shutdown).await
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Fan envelopes out to sessions; connections whose write fails go to the
/// unregister queue.
pub async fn run_broadcaster(
    mut broadcast: mpsc::Receiver<Envelope>,
    registry: Arc<ConnectionRegistry>,
    unregister: mpsc::Sender<Arc<Connection>>,
    shutdown: CancellationToken,
) {
    info!("broadcaster started");
    while let Some(envelope) = next(&mut broadcast, &shutdown).await {
        let failed = match AssertUnwindSafe(fan_out(&registry, &envelope)).catch_unwind().await {
            Ok(failed) => failed,
            Err(_) => {
                error!("broadcaster panicked on an envelope, continuing");
                continue;
            }
        };

        for conn in failed {
            if !forward(&unregister, conn, &shutdown).await {
                break;
            }
        }
    }
    info!("broadcaster stopped");
}

/// Deliver one envelope. Returns the connections that could not be
/// written to.
///
/// Recipients are snapshotted from the registry first; no lock is held
/// while writing.
pub async fn fan_out(registry: &ConnectionRegistry, envelope: &Envelope) -> Vec<Arc<Connection>> {
    let deliveries: Vec<(Arc<Connection>, ServerMessage)> = match envelope.kind() {
        MessageKind::Private => {
            let mut deliveries = Vec::with_capacity(2);
            if let Some(target) = envelope.target() {
                match registry.lookup(target).await {
                    Some(conn) => deliveries.push((conn, envelope.private_line())),
                    None => debug!(target = %target, "private target went offline"),
                }
            }
            if let Some(sender) = registry.lookup(envelope.sender()).await {
                deliveries.push((sender, envelope.private_receipt()));
            }
            deliveries
        }
        MessageKind::Chat | MessageKind::System => {
            let line = envelope.broadcast_line();
            registry
                .snapshot()
                .await
                .into_iter()
                .map(|(_, conn)| (conn, line.clone()))
                .collect()
        }
    };

    let results = join_all(deliveries.into_iter().map(|(conn, message)| async move {
        let sent = conn.send(&message).await;
        (conn, sent)
    }))
    .await;

    results
        .into_iter()
        .filter_map(|(conn, sent)| match sent {
            Ok(()) => None,
            Err(e) => {
                debug!(conn_id = conn.id(), peer = %conn.peer(), "write failed: {}", e);
                Some(conn)
            }
        })
        .collect()
}

// =============================================================================
// Unregister handler
// =============================================================================

/// Remove dead connections from the registry
pub async fn run_unregister(
    mut unregister: mpsc::Receiver<Arc<Connection>>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    info!("unregister handler started");
    while let Some(conn) = next(&mut unregister, &shutdown).await {
        if AssertUnwindSafe(registry.remove(&conn)).catch_unwind().await.is_err() {
            error!(conn_id = conn.id(), "unregister panicked, continuing");
            conn.close().await;
        }
    }
    info!("unregister handler stopped");
}

// =============================================================================
// Admission
// =============================================================================

/// Start a session task for every accepted connection
pub async fn run_admission(mut register: mpsc::Receiver<PendingConnection>, ctx: SessionContext) {
    let shutdown = ctx.shutdown.token();
    info!("admission started");
    while let Some(pending) = next(&mut register, &shutdown).await {
        debug!(conn_id = pending.conn.id(), peer = %pending.conn.peer(), "session starting");
        spawn_session(ctx.clone(), pending.conn, pending.reader);
    }

    // Connections still queued never got a session
    register.close();
    while let Ok(pending) = register.try_recv() {
        pending.conn.close().await;
    }
    info!("admission stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ChatError, Result};
    use crate::protocol::messages::ReplyKind;
    use crate::server::session::testing::Harness;
    use crate::store::{QueuedChat, ReadCursor, SqliteQueue};

    /// Wraps a real queue; can refuse enqueues or panic on a given sender
    struct FlakyQueue {
        inner: SqliteQueue,
        fail_enqueue: bool,
        panic_for: Option<&'static str>,
    }

    impl FlakyQueue {
        async fn new(fail_enqueue: bool, panic_for: Option<&'static str>) -> Arc<Self> {
            let inner = SqliteQueue::open_in_memory(1000).unwrap();
            inner.create_consumer_group().await.unwrap();
            Arc::new(Self {
                inner,
                fail_enqueue,
                panic_for,
            })
        }
    }

    #[async_trait]
    impl DurableQueue for FlakyQueue {
        async fn enqueue_chat(&self, envelope: &Envelope) -> Result<i64> {
            if self.fail_enqueue {
                return Err(ChatError::store("stream unavailable"));
            }
            self.inner.enqueue_chat(envelope).await
        }

        async fn create_consumer_group(&self) -> Result<()> {
            self.inner.create_consumer_group().await
        }

        async fn read_group(
            &self,
            consumer: &str,
            cursor: ReadCursor,
            count: usize,
            block: Duration,
        ) -> Result<Vec<QueuedChat>> {
            self.inner.read_group(consumer, cursor, count, block).await
        }

        async fn ack(&self, id: i64) -> Result<()> {
            self.inner.ack(id).await
        }

        async fn increment_activity(&self, name: &str) -> Result<()> {
            if self.panic_for == Some(name) {
                panic!("activity counter exploded");
            }
            self.inner.increment_activity(name).await
        }

        async fn recent_history(&self, count: usize) -> Result<Vec<String>> {
            self.inner.recent_history(count).await
        }

        async fn top_active(&self, count: usize) -> Result<Vec<String>> {
            self.inner.top_active(count).await
        }

        async fn reset(&self) -> Result<()> {
            self.inner.reset().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn recv_within<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn spawn_dispatcher(
        queue: Arc<dyn DurableQueue>,
    ) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>, CancellationToken) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_dispatcher(inbound_rx, queue, broadcast_tx, shutdown.clone()));
        (inbound_tx, broadcast_rx, shutdown)
    }

    #[tokio::test]
    async fn test_chat_goes_through_durable_queue() {
        let queue = FlakyQueue::new(false, None).await;
        let (inbound, mut broadcast, shutdown) = spawn_dispatcher(queue.clone());

        inbound.send(Envelope::chat("alice", 1, "hello")).await.unwrap();
        inbound.send(Envelope::system("marker")).await.unwrap();

        // Only the system envelope takes the direct path
        assert_eq!(recv_within(&mut broadcast).await.body(), "marker");
        let queued = queue
            .read_group("c1", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].body, "hello");
        assert_eq!(
            queue.top_active(5).await.unwrap(),
            vec!["Rank 1: alice (1 messages)"]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_enqueue_falls_back_to_broadcast() {
        let queue = FlakyQueue::new(true, None).await;
        let (inbound, mut broadcast, shutdown) = spawn_dispatcher(queue.clone());

        inbound.send(Envelope::chat("alice", 1, "hello")).await.unwrap();

        let envelope = recv_within(&mut broadcast).await;
        assert_eq!(envelope.broadcast_line().text, "[alice]: hello");
        // The attempt still counts toward ranking
        assert_eq!(
            queue.top_active(5).await.unwrap(),
            vec!["Rank 1: alice (1 messages)"]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_private_bypasses_queue() {
        let queue = FlakyQueue::new(false, None).await;
        let (inbound, mut broadcast, shutdown) = spawn_dispatcher(queue.clone());

        inbound.send(Envelope::private("alice", 1, "bob", "psst")).await.unwrap();

        assert_eq!(recv_within(&mut broadcast).await.kind(), MessageKind::Private);
        assert!(queue.recent_history(10).await.unwrap().is_empty());
        assert!(queue.top_active(5).await.unwrap().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dispatcher_survives_a_panic() {
        let queue = FlakyQueue::new(true, Some("mallory")).await;
        let (inbound, mut broadcast, shutdown) = spawn_dispatcher(queue);

        inbound.send(Envelope::chat("mallory", 1, "boom")).await.unwrap();
        inbound.send(Envelope::chat("alice", 2, "still here")).await.unwrap();

        assert_eq!(recv_within(&mut broadcast).await.body(), "still here");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let harness = Harness::new().await;
        let (alice, _ar, mut alice_peer) = harness.connect();
        let (bob, _br, mut bob_peer) = harness.connect();
        harness.ctx.registry.try_register("alice", &alice).await;
        harness.ctx.registry.try_register("bob", &bob).await;

        let failed = fan_out(&harness.ctx.registry, &Envelope::chat("alice", alice.id(), "hi")).await;
        assert!(failed.is_empty());

        for peer in [&mut alice_peer, &mut bob_peer] {
            let msg = peer.recv().await;
            assert_eq!(msg.kind, ReplyKind::Chat);
            assert_eq!(msg.text, "[alice]: hi");
        }
    }

    #[tokio::test]
    async fn test_private_reaches_target_and_sender_only() {
        let harness = Harness::new().await;
        let (alice, _ar, mut alice_peer) = harness.connect();
        let (bob, _br, mut bob_peer) = harness.connect();
        let (carol, _cr, mut carol_peer) = harness.connect();
        harness.ctx.registry.try_register("alice", &alice).await;
        harness.ctx.registry.try_register("bob", &bob).await;
        harness.ctx.registry.try_register("carol", &carol).await;

        let envelope = Envelope::private("alice", alice.id(), "bob", "psst");
        assert!(fan_out(&harness.ctx.registry, &envelope).await.is_empty());

        assert_eq!(bob_peer.recv().await.text, "[private from alice]: psst");
        assert_eq!(alice_peer.recv().await.text, "[private to bob]: psst");

        // carol sees the next broadcast, not the private message
        fan_out(&harness.ctx.registry, &Envelope::system("ping")).await;
        assert_eq!(carol_peer.recv().await.text, "ping");
    }

    #[tokio::test]
    async fn test_failed_writes_are_unregistered() {
        let mut harness = Harness::new().await;
        let (alice, _ar, mut alice_peer) = harness.connect();
        let (bob, _br, _bob_peer) = harness.connect();
        harness.ctx.registry.try_register("alice", &alice).await;
        harness.ctx.registry.try_register("bob", &bob).await;
        harness.inbound.recv().await.unwrap();
        harness.inbound.recv().await.unwrap();
        bob.close().await;

        let (broadcast_tx, broadcast_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_broadcaster(
            broadcast_rx,
            harness.ctx.registry.clone(),
            unregister_tx,
            shutdown.clone(),
        ));
        tokio::spawn(run_unregister(
            unregister_rx,
            harness.ctx.registry.clone(),
            shutdown.clone(),
        ));

        broadcast_tx.send(Envelope::chat("alice", alice.id(), "anyone?")).await.unwrap();
        assert_eq!(alice_peer.recv().await.text, "[alice]: anyone?");

        let offline = recv_within(&mut harness.inbound).await;
        assert_eq!(offline.body(), "bob went offline (1 online)");
        assert!(!harness.ctx.registry.is_taken("bob").await);
        assert!(harness.ctx.registry.is_taken("alice").await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_admission_starts_sessions() {
        let harness = Harness::new().await;
        let (register_tx, register_rx) = mpsc::channel(4);
        tokio::spawn(run_admission(register_rx, harness.ctx.clone()));

        let (conn, reader, mut peer) = harness.connect();
        register_tx
            .send(PendingConnection { conn, reader })
            .await
            .unwrap();

        assert_eq!(peer.recv().await.kind, ReplyKind::Menu);
    }
}
