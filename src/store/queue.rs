//! Durable chat queue with consumer-group replay
//!
//! Chat envelopes are appended to an ordered stream. A single consumer
//! group hands each entry to exactly one worker and tracks it as pending
//! until the worker acknowledges it, so delivery is at-least-once: a
//! worker that dies before acking gets the entry again on restart.
//!
//! The queue also owns the per-name activity counter behind `/rank`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use rusqlite::{OptionalExtension, params};
use rusqlite_migration::{M, Migrations};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::Db;
use crate::error::{ChatError, Result};
use crate::protocol::messages::Envelope;

/// Name of the consumer group used by the replay workers
pub const CHAT_GROUP: &str = "chat_group";

/// A chat entry read back from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChat {
    pub id: i64,
    pub sender: String,
    pub body: String,
}

impl QueuedChat {
    /// Rebuild the routing envelope; replayed chat has no live origin
    pub fn to_envelope(&self) -> Envelope {
        Envelope::replayed(self.sender.clone(), self.body.clone())
    }
}

/// Where a consumer reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// This consumer's own unacknowledged entries with id greater than the
    /// given one
    Pending(i64),
    /// Entries never delivered to any consumer of the group
    New,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append a chat envelope, returning its stream id
    async fn enqueue_chat(&self, envelope: &Envelope) -> Result<i64>;

    /// Create the consumer group. Idempotent.
    async fn create_consumer_group(&self) -> Result<()>;

    /// Claim up to `count` entries for `consumer`.
    ///
    /// A `New` read that finds nothing waits up to `block` for an enqueue
    /// before returning empty.
    async fn read_group(
        &self,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueuedChat>>;

    /// Acknowledge a delivered entry
    async fn ack(&self, id: i64) -> Result<()>;

    /// Bump the activity score of `name` by one
    async fn increment_activity(&self, name: &str) -> Result<()>;

    /// Last `count` chat lines, oldest first
    async fn recent_history(&self, count: usize) -> Result<Vec<String>>;

    /// Top `count` senders by descending score, ties by descending name
    async fn top_active(&self, count: usize) -> Result<Vec<String>>;

    /// Drop all chat entries, pending state and activity scores
    async fn reset(&self) -> Result<()>;

    async fn close(&self);

    /// False for a queue that rejects every operation
    fn is_available(&self) -> bool {
        true
    }
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE chat_stream (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE consumer_groups (
            name TEXT PRIMARY KEY,
            last_delivered INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE pending (
            entry_id INTEGER PRIMARY KEY,
            consumer TEXT NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            delivered_at INTEGER NOT NULL
        );
        CREATE INDEX idx_pending_consumer ON pending(consumer, entry_id);
        CREATE TABLE activity (
            name TEXT PRIMARY KEY,
            score INTEGER NOT NULL DEFAULT 0
        );",
    )])
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn format_history_line(created_at: i64, sender: &str, body: &str) -> String {
    let stamp = DateTime::from_timestamp_millis(created_at)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown time".to_string());
    format!("[{}] {}: {}", stamp, sender, body)
}

/// SQLite-backed durable queue
pub struct SqliteQueue {
    db: Db,
    retention: u64,
    appended: Arc<Notify>,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`, keeping at most
    /// `retention` chat entries
    pub fn open(path: &Path, retention: u64) -> Result<Self> {
        Ok(Self::with_db(Db::open(path, &migrations(), "durable queue")?, retention))
    }

    pub fn open_in_memory(retention: u64) -> Result<Self> {
        Ok(Self::with_db(
            Db::open_in_memory(&migrations(), "durable queue")?,
            retention,
        ))
    }

    fn with_db(db: Db, retention: u64) -> Self {
        Self {
            db,
            retention: retention.max(1),
            appended: Arc::new(Notify::new()),
        }
    }

    async fn read_pending(&self, consumer: &str, after: i64, count: usize) -> Result<Vec<QueuedChat>> {
        let consumer = consumer.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let entries = {
                    let mut stmt = tx.prepare(
                        "SELECT s.id, s.sender, s.body
                         FROM pending p JOIN chat_stream s ON s.id = p.entry_id
                         WHERE p.consumer = ?1 AND p.entry_id > ?2
                         ORDER BY p.entry_id
                         LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![consumer, after, count as i64], |row| {
                        Ok(QueuedChat {
                            id: row.get(0)?,
                            sender: row.get(1)?,
                            body: row.get(2)?,
                        })
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for entry in &entries {
                    tx.execute(
                        "UPDATE pending SET delivery_count = delivery_count + 1, delivered_at = ?2
                         WHERE entry_id = ?1",
                        params![entry.id, now_millis()],
                    )?;
                }
                tx.commit()?;
                Ok(entries)
            })
            .await
    }

    async fn claim_new(&self, consumer: &str, count: usize) -> Result<Vec<QueuedChat>> {
        let consumer = consumer.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let last: Option<i64> = tx
                    .query_row(
                        "SELECT last_delivered FROM consumer_groups WHERE name = ?1",
                        params![CHAT_GROUP],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(last) = last else {
                    return Err(ChatError::store(format!(
                        "consumer group '{}' does not exist",
                        CHAT_GROUP
                    )));
                };

                let entries = {
                    let mut stmt = tx.prepare(
                        "SELECT id, sender, body FROM chat_stream
                         WHERE id > ?1 ORDER BY id LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![last, count as i64], |row| {
                        Ok(QueuedChat {
                            id: row.get(0)?,
                            sender: row.get(1)?,
                            body: row.get(2)?,
                        })
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                if let Some(newest) = entries.last() {
                    let delivered_at = now_millis();
                    for entry in &entries {
                        tx.execute(
                            "INSERT OR REPLACE INTO pending (entry_id, consumer, delivery_count, delivered_at)
                             VALUES (?1, ?2, 1, ?3)",
                            params![entry.id, consumer, delivered_at],
                        )?;
                    }
                    tx.execute(
                        "UPDATE consumer_groups SET last_delivered = ?2 WHERE name = ?1",
                        params![CHAT_GROUP, newest.id],
                    )?;
                }
                tx.commit()?;
                Ok(entries)
            })
            .await
    }
}

#[async_trait]
impl DurableQueue for SqliteQueue {
    async fn enqueue_chat(&self, envelope: &Envelope) -> Result<i64> {
        let sender = envelope.sender().to_string();
        let body = envelope.body().to_string();
        let retention = self.retention as i64;

        let id = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO chat_stream (sender, body, created_at) VALUES (?1, ?2, ?3)",
                    params![sender, body, now_millis()],
                )?;
                let id = tx.last_insert_rowid();

                let cutoff = id - retention;
                if cutoff > 0 {
                    tx.execute("DELETE FROM pending WHERE entry_id <= ?1", params![cutoff])?;
                    tx.execute("DELETE FROM chat_stream WHERE id <= ?1", params![cutoff])?;
                }
                tx.commit()?;
                Ok(id)
            })
            .await?;

        debug!(entry_id = id, "chat enqueued");
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_consumer_group(&self) -> Result<()> {
        self.db
            .call(|conn| {
                let created = conn.execute(
                    "INSERT OR IGNORE INTO consumer_groups (name, last_delivered) VALUES (?1, 0)",
                    params![CHAT_GROUP],
                )?;
                if created > 0 {
                    info!("consumer group '{}' created", CHAT_GROUP);
                }
                Ok(())
            })
            .await
    }

    async fn read_group(
        &self,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueuedChat>> {
        if let ReadCursor::Pending(after) = cursor {
            return self.read_pending(consumer, after, count).await;
        }

        // Register interest before looking so an enqueue between the empty
        // read and the wait is not missed.
        let appended = Arc::clone(&self.appended);
        let notified = appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let entries = self.claim_new(consumer, count).await?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }

        if tokio::time::timeout(block, notified).await.is_err() {
            return Ok(Vec::new());
        }
        self.claim_new(consumer, count).await
    }

    async fn ack(&self, id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM pending WHERE entry_id = ?1", params![id])?;
                Ok(())
            })
            .await
    }

    async fn increment_activity(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity (name, score) VALUES (?1, 1)
                     ON CONFLICT(name) DO UPDATE SET score = score + 1",
                    params![name],
                )?;
                Ok(())
            })
            .await
    }

    async fn recent_history(&self, count: usize) -> Result<Vec<String>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sender, body, created_at FROM chat_stream ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![count as i64], |row| {
                    Ok(format_history_line(
                        row.get(2)?,
                        &row.get::<_, String>(0)?,
                        &row.get::<_, String>(1)?,
                    ))
                })?;
                let mut lines = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                lines.reverse();
                Ok(lines)
            })
            .await
    }

    async fn top_active(&self, count: usize) -> Result<Vec<String>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, score FROM activity ORDER BY score DESC, name DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![count as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let ranked = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ranked
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, score))| format!("Rank {}: {} ({} messages)", i + 1, name, score))
                    .collect())
            })
            .await
    }

    async fn reset(&self) -> Result<()> {
        self.db
            .call(|conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM pending", [])?;
                tx.execute("DELETE FROM chat_stream", [])?;
                tx.execute("DELETE FROM activity", [])?;
                tx.execute("UPDATE consumer_groups SET last_delivered = 0", [])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        info!("durable queue reset");
        Ok(())
    }

    async fn close(&self) {
        self.db.close().await;
        self.appended.notify_waiters();
    }
}

/// Stand-in used when no durable queue is available.
///
/// Every operation fails, which sends chat down the direct broadcast path
/// and makes `/history` and `/rank` report themselves unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledQueue;

impl DisabledQueue {
    fn unavailable<T>() -> Result<T> {
        Err(ChatError::store("durable queue is disabled"))
    }
}

#[async_trait]
impl DurableQueue for DisabledQueue {
    async fn enqueue_chat(&self, _envelope: &Envelope) -> Result<i64> {
        Self::unavailable()
    }

    async fn create_consumer_group(&self) -> Result<()> {
        Self::unavailable()
    }

    async fn read_group(
        &self,
        _consumer: &str,
        _cursor: ReadCursor,
        _count: usize,
        _block: Duration,
    ) -> Result<Vec<QueuedChat>> {
        Self::unavailable()
    }

    async fn ack(&self, _id: i64) -> Result<()> {
        Self::unavailable()
    }

    async fn increment_activity(&self, _name: &str) -> Result<()> {
        Self::unavailable()
    }

    async fn recent_history(&self, _count: usize) -> Result<Vec<String>> {
        Self::unavailable()
    }

    async fn top_active(&self, _count: usize) -> Result<Vec<String>> {
        Self::unavailable()
    }

    async fn reset(&self) -> Result<()> {
        Self::unavailable()
    }

    async fn close(&self) {}

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;

    async fn queue_with_group() -> SqliteQueue {
        let queue = SqliteQueue::open_in_memory(1000).unwrap();
        queue.create_consumer_group().await.unwrap();
        queue
    }

    async fn enqueue(queue: &SqliteQueue, sender: &str, body: &str) -> i64 {
        queue
            .enqueue_chat(&Envelope::chat(sender, 1, body))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_group_is_idempotent() {
        let queue = queue_with_group().await;
        queue.create_consumer_group().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let queue = SqliteQueue::open_in_memory(1000).unwrap();
        enqueue(&queue, "alice", "hi").await;

        let err = queue
            .read_group("c1", ReadCursor::New, 10, NO_WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Store(_)));
    }

    #[tokio::test]
    async fn test_entries_are_delivered_once_across_consumers() {
        let queue = queue_with_group().await;
        for i in 0..4 {
            enqueue(&queue, "alice", &format!("m{}", i)).await;
        }

        let first = queue.read_group("c1", ReadCursor::New, 3, NO_WAIT).await.unwrap();
        let second = queue.read_group("c2", ReadCursor::New, 3, NO_WAIT).await.unwrap();
        let third = queue.read_group("c3", ReadCursor::New, 3, NO_WAIT).await.unwrap();

        let bodies: Vec<_> = first.iter().chain(&second).map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3"]);
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_unacked_entries_are_redelivered_to_same_consumer() {
        let queue = queue_with_group().await;
        let id1 = enqueue(&queue, "alice", "one").await;
        let id2 = enqueue(&queue, "bob", "two").await;

        let claimed = queue.read_group("c1", ReadCursor::New, 10, NO_WAIT).await.unwrap();
        assert_eq!(claimed.len(), 2);
        queue.ack(id1).await.unwrap();

        // Restarted worker: only the unacked entry comes back
        let pending = queue
            .read_group("c1", ReadCursor::Pending(0), 10, NO_WAIT)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id2);
        assert_eq!(pending[0].to_envelope().broadcast_line().text, "[bob]: two");

        // Other consumers never see it
        let other = queue
            .read_group("c2", ReadCursor::Pending(0), 10, NO_WAIT)
            .await
            .unwrap();
        assert!(other.is_empty());

        queue.ack(id2).await.unwrap();
        let drained = queue
            .read_group("c1", ReadCursor::Pending(0), 10, NO_WAIT)
            .await
            .unwrap();
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_enqueue() {
        let queue = Arc::new(queue_with_group().await);

        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .read_group("c1", ReadCursor::New, 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        enqueue(&queue, "alice", "late").await;

        let entries = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, "late");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let queue = queue_with_group().await;
        let entries = queue
            .read_group("c1", ReadCursor::New, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_history_returns_last_entries_in_order() {
        let queue = queue_with_group().await;
        for i in 1..=12 {
            enqueue(&queue, "alice", &format!("msg {}", i)).await;
        }

        let history = queue.recent_history(10).await.unwrap();
        assert_eq!(history.len(), 10);
        assert!(history[0].ends_with("] alice: msg 3"));
        assert!(history[9].ends_with("] alice: msg 12"));

        let short = queue.recent_history(50).await.unwrap();
        assert_eq!(short.len(), 12);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest_entries() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        queue.create_consumer_group().await.unwrap();

        enqueue(&queue, "alice", "a").await;
        queue.read_group("c1", ReadCursor::New, 1, NO_WAIT).await.unwrap();
        for body in ["b", "c", "d"] {
            enqueue(&queue, "alice", body).await;
        }

        let history = queue.recent_history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].ends_with(": b"));

        // The trimmed entry is gone from the pending list too
        let pending = queue
            .read_group("c1", ReadCursor::Pending(0), 10, NO_WAIT)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_rank_orders_by_score_then_name_descending() {
        let queue = queue_with_group().await;
        for name in ["carol", "bob", "alice", "bob", "carol", "bob"] {
            queue.increment_activity(name).await.unwrap();
        }
        queue.increment_activity("dave").await.unwrap();

        let rank = queue.top_active(3).await.unwrap();
        assert_eq!(
            rank,
            vec![
                "Rank 1: bob (3 messages)",
                "Rank 2: carol (2 messages)",
                "Rank 3: dave (1 messages)",
            ]
        );
    }

    #[tokio::test]
    async fn test_rank_ties_list_later_names_first() {
        let queue = queue_with_group().await;
        for name in ["alice", "bob", "carol"] {
            queue.increment_activity(name).await.unwrap();
        }

        assert_eq!(
            queue.top_active(5).await.unwrap(),
            vec![
                "Rank 1: carol (1 messages)",
                "Rank 2: bob (1 messages)",
                "Rank 3: alice (1 messages)",
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_clears_stream_and_rank() {
        let queue = queue_with_group().await;
        enqueue(&queue, "alice", "hi").await;
        queue.increment_activity("alice").await.unwrap();

        queue.reset().await.unwrap();

        assert!(queue.recent_history(10).await.unwrap().is_empty());
        assert!(queue.top_active(5).await.unwrap().is_empty());
        let id = enqueue(&queue, "bob", "after reset").await;
        let entries = queue.read_group("c1", ReadCursor::New, 10, NO_WAIT).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
    }

    #[tokio::test]
    async fn test_disabled_queue_rejects_everything() {
        let queue = DisabledQueue;
        assert!(!queue.is_available());
        assert!(queue.enqueue_chat(&Envelope::chat("a", 1, "b")).await.is_err());
        assert!(queue.increment_activity("a").await.is_err());
        assert!(queue.recent_history(10).await.is_err());
        assert!(queue.top_active(5).await.is_err());
        assert!(
            queue
                .read_group("c1", ReadCursor::New, 1, NO_WAIT)
                .await
                .is_err()
        );
    }
}
