//! Credential store: registered names and their password hashes

use std::path::Path;

use async_trait::async_trait;
use rand::Rng;
use rusqlite::{OptionalExtension, params};
use rusqlite_migration::{M, Migrations};
use sha2::{Digest, Sha256};
use tracing::info;

use super::Db;
use crate::error::Result;

/// Name/password registry consulted by the authentication flow.
///
/// Any error means the store is unavailable.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether `name` has been registered
    async fn name_exists(&self, name: &str) -> Result<bool>;

    /// Register a new name. Fails if the name is already taken.
    async fn register(&self, name: &str, password: &str) -> Result<()>;

    /// Check a name/password pair. Unknown names verify as `false`.
    async fn verify_credentials(&self, name: &str, password: &str) -> Result<bool>;

    /// Release the backing connection
    async fn close(&self);
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE users (
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )])
}

/// SHA-256 over salt || password, hex encoded
fn hash_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// SQLite-backed credential store
#[derive(Clone)]
pub struct SqliteCredentialStore {
    db: Db,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Db::open(path, &migrations(), "credential store")?,
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Db::open_in_memory(&migrations(), "credential store")?,
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn name_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE username = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    async fn register(&self, name: &str, password: &str) -> Result<()> {
        let salt: [u8; 16] = rand::rng().random();
        let hash = hash_password(&salt, password);
        let name = name.to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (username, password_hash, salt, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![name, hash, hex::encode(salt), created_at],
                )?;
                info!(name = %name, "user registered");
                Ok(())
            })
            .await
    }

    async fn verify_credentials(&self, name: &str, password: &str) -> Result<bool> {
        let name = name.to_string();
        let stored = self
            .db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT password_hash, salt FROM users WHERE username = ?1",
                        params![name],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((hash, salt)) = stored else {
            return Ok(false);
        };
        let Ok(salt) = hex::decode(salt) else {
            return Ok(false);
        };
        Ok(hash_password(&salt, password) == hash)
    }

    async fn close(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;

    #[tokio::test]
    async fn test_register_and_verify() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();

        assert!(!store.name_exists("alice").await.unwrap());
        store.register("alice", "p1").await.unwrap();
        assert!(store.name_exists("alice").await.unwrap());

        assert!(store.verify_credentials("alice", "p1").await.unwrap());
        assert!(!store.verify_credentials("alice", "p2").await.unwrap());
        assert!(!store.verify_credentials("bob", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.register("Alice", "p1").await.unwrap();
        assert!(!store.name_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.register("alice", "p1").await.unwrap();

        let err = store.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, ChatError::Store(_)));
        assert!(store.verify_credentials("alice", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_passwords_are_not_stored_in_clear() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.register("alice", "hunter2").await.unwrap();

        let stored: String = store
            .db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT password_hash FROM users WHERE username = 'alice'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(stored.len(), 64);
    }

    #[tokio::test]
    async fn test_closed_store_reports_errors() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.close().await;

        assert!(matches!(
            store.name_exists("alice").await,
            Err(ChatError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");

        let store = SqliteCredentialStore::open(&path).unwrap();
        store.register("alice", "p1").await.unwrap();
        store.close().await;

        let reopened = SqliteCredentialStore::open(&path).unwrap();
        assert!(reopened.verify_credentials("alice", "p1").await.unwrap());
    }
}
