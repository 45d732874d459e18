//! Connection registry
//!
//! The only state shared between tasks: which name is bound to which live
//! connection. Both directions are kept in one structure behind one lock so
//! they can never disagree. No await on I/O happens while the lock is held;
//! announcements are emitted after it is released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::messages::{ConnId, Envelope};
use crate::transport::connection::Connection;

#[derive(Default)]
struct Members {
    by_name: HashMap<String, Arc<Connection>>,
    by_conn: HashMap<ConnId, String>,
}

/// Name <-> connection map for authenticated sessions
pub struct ConnectionRegistry {
    members: RwLock<Members>,
    events: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    /// Create an empty registry. Join/leave announcements go to `events`.
    pub fn new(events: mpsc::Sender<Envelope>, shutdown: CancellationToken) -> Self {
        Self {
            members: RwLock::new(Members::default()),
            events,
            shutdown,
        }
    }

    /// Whether `name` has a live session
    pub async fn is_taken(&self, name: &str) -> bool {
        self.members.read().await.by_name.contains_key(name)
    }

    /// Bind `name` to `conn` if the name is free.
    ///
    /// The check and both inserts happen in one critical section, so two
    /// sessions racing for the same name cannot both win. Always refused
    /// once shutdown has started.
    pub async fn try_register(&self, name: &str, conn: &Arc<Connection>) -> bool {
        let online = {
            let mut members = self.members.write().await;
            if self.shutdown.is_cancelled()
                || members.by_name.contains_key(name)
                || members.by_conn.contains_key(&conn.id())
            {
                return false;
            }
            members.by_name.insert(name.to_string(), Arc::clone(conn));
            members.by_conn.insert(conn.id(), name.to_string());
            members.by_name.len()
        };

        info!(name = %name, conn_id = conn.id(), online, "session registered");
        self.emit(Envelope::system(format!("{} is online ({} online)", name, online)))
            .await;
        true
    }

    /// Remove `conn` and close it.
    ///
    /// The name is only unbound if it still points at this exact
    /// connection; a newer session that reused the name is left alone.
    /// Returns the removed name.
    pub async fn remove(&self, conn: &Arc<Connection>) -> Option<String> {
        let removed = {
            let mut members = self.members.write().await;
            let owns_name = members
                .by_conn
                .get(&conn.id())
                .and_then(|name| members.by_name.get(name))
                .is_some_and(|current| current.id() == conn.id());

            if owns_name {
                members.by_conn.remove(&conn.id()).map(|name| {
                    members.by_name.remove(&name);
                    (name, members.by_name.len())
                })
            } else {
                None
            }
        };

        conn.close().await;

        let (name, online) = removed?;
        info!(name = %name, conn_id = conn.id(), online, "session removed");
        self.emit(Envelope::system(format!("{} went offline ({} online)", name, online)))
            .await;
        Some(name)
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<Connection>> {
        self.members.read().await.by_name.get(name).cloned()
    }

    /// Online names, sorted
    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.read().await.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Point-in-time copy of every (name, connection) pair for fan-out
    pub async fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        self.members
            .read()
            .await
            .by_name
            .iter()
            .map(|(name, conn)| (name.clone(), Arc::clone(conn)))
            .collect()
    }

    /// Take every pair out of the registry, leaving it empty
    pub async fn snapshot_and_clear(&self) -> Vec<(String, Arc<Connection>)> {
        let mut members = self.members.write().await;
        members.by_conn.clear();
        members.by_name.drain().collect()
    }

    pub async fn online_count(&self) -> usize {
        self.members.read().await.by_name.len()
    }

    async fn emit(&self, envelope: Envelope) {
        let body = envelope.body().to_string();
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("shutting down, dropping announcement: {}", body);
            }
            sent = self.events.send(envelope) => {
                if sent.is_err() {
                    debug!("inbound queue closed, announcement dropped");
                }
            }
        }
    }
}
