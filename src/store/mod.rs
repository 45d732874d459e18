//! External collaborators: the credential store and the durable chat queue
//!
//! Both are reached through async traits so the routing engine never depends
//! on a concrete backend. The shipped backends keep their data in SQLite.

pub mod consumer;
pub mod credentials;
pub mod queue;

pub use consumer::{ConsumerWorker, spawn_consumer};
pub use credentials::{CredentialStore, SqliteCredentialStore};
pub use queue::{DisabledQueue, DurableQueue, QueuedChat, ReadCursor, SqliteQueue};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use rusqlite_migration::Migrations;
use tracing::info;

use crate::error::{ChatError, Result};

/// Shared SQLite connection.
///
/// rusqlite is synchronous, so every call runs on the blocking pool.
/// `None` after [`Db::close`].
#[derive(Clone)]
pub(crate) struct Db {
    conn: Arc<Mutex<Option<Connection>>>,
    label: &'static str,
}

impl Db {
    /// Open (or create) a database file and bring its schema up to date
    pub(crate) fn open(path: &Path, migrations: &Migrations<'static>, label: &'static str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self::init(conn, migrations, label)?;
        info!("{} initialized at {}", label, path.display());
        Ok(db)
    }

    /// Open a private in-memory database
    pub(crate) fn open_in_memory(migrations: &Migrations<'static>, label: &'static str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, migrations, label)
    }

    fn init(mut conn: Connection, migrations: &Migrations<'static>, label: &'static str) -> Result<Self> {
        migrations.to_latest(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            label,
        })
    }

    /// Run `f` against the connection on the blocking pool
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let label = self.label;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ChatError::store(format!("{} lock poisoned", label)))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| ChatError::store(format!("{} is closed", label)))?;
            f(conn)
        })
        .await?
    }

    /// Drop the underlying connection; later calls fail with a store error
    pub(crate) async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || match conn.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        })
        .await
        .unwrap_or(false);

        if closed {
            info!("{} closed", self.label);
        }
    }
}
