//! Consumer replay workers
//!
//! Each worker claims chat entries for its own consumer identity, pushes
//! them onto the broadcast queue, then acknowledges them. A worker first
//! drains whatever it left unacknowledged in a previous run, then moves on
//! to new entries.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{DurableQueue, QueuedChat, ReadCursor};
use crate::protocol::messages::Envelope;

const READ_BATCH: usize = 10;
const READ_BLOCK: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Exponential read-error backoff, owned by one worker
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// One replay worker
pub struct ConsumerWorker {
    queue: Arc<dyn DurableQueue>,
    consumer_id: String,
    broadcast: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    cursor: ReadCursor,
    backoff: Backoff,
}

impl ConsumerWorker {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        consumer_id: impl Into<String>,
        broadcast: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            consumer_id: consumer_id.into(),
            broadcast,
            shutdown,
            cursor: ReadCursor::Pending(0),
            backoff: Backoff::new(),
        }
    }

    /// Run until shutdown or until the broadcast queue goes away
    pub async fn run(mut self) {
        info!(consumer = %self.consumer_id, "consumer started");

        'read: loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = self.queue.read_group(&self.consumer_id, self.cursor, READ_BATCH, READ_BLOCK) => read,
            };

            let entries = match read {
                Ok(entries) => {
                    self.backoff.reset();
                    entries
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(consumer = %self.consumer_id, "queue read failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                if let ReadCursor::Pending(_) = self.cursor {
                    debug!(consumer = %self.consumer_id, "pending entries drained");
                    self.cursor = ReadCursor::New;
                }
                continue;
            }

            for entry in entries {
                if let ReadCursor::Pending(_) = self.cursor {
                    self.cursor = ReadCursor::Pending(entry.id);
                }
                if !self.deliver(entry).await {
                    break 'read;
                }
            }
        }

        info!(consumer = %self.consumer_id, "consumer stopped");
    }

    /// Hand one entry to the broadcaster and ack it. Returns false when the
    /// worker should stop.
    async fn deliver(&self, entry: QueuedChat) -> bool {
        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => return false,
            sent = self.broadcast.send(entry.to_envelope()) => sent,
        };
        if sent.is_err() {
            // Unacked: the entry stays pending for the next run
            debug!(consumer = %self.consumer_id, entry_id = entry.id, "broadcast queue closed");
            return false;
        }

        if let Err(e) = self.queue.ack(entry.id).await {
            warn!(consumer = %self.consumer_id, entry_id = entry.id, "ack failed: {}", e);
        }
        true
    }
}

/// Spawn a replay worker parented to `shutdown`.
///
/// A panicking worker is logged and replaced by a fresh one, which first
/// re-reads whatever the old one left unacknowledged.
pub fn spawn_consumer(
    queue: Arc<dyn DurableQueue>,
    consumer_id: impl Into<String>,
    broadcast: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let consumer_id = consumer_id.into();
    tokio::spawn(async move {
        loop {
            let worker = ConsumerWorker::new(
                Arc::clone(&queue),
                consumer_id.clone(),
                broadcast.clone(),
                shutdown.clone(),
            );
            match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(()) => break,
                Err(_) => {
                    error!(consumer = %consumer_id, "consumer panicked, restarting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                    }
                }
            }
        }
    })
}
