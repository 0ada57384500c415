//! Durable latest-state storage for sessions.
//!
//! One key per session, `transload:<token>`, holding the JSON of the latest
//! event. Writes overwrite; nothing is versioned or appended.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

use crate::constants::STATE_KEY_PREFIX;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Durable key for a session's state.
#[must_use]
pub fn state_key(token: &str) -> String {
    format!("{STATE_KEY_PREFIX}:{token}")
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database query or connection failure.
    #[error("state store database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("failed to run state store migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Backend not reachable.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value mapping holding the latest event payload per session.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Writes `payload` under `key`, replacing any previous value.
    async fn put(&self, key: &str, payload: &str) -> Result<(), StoreError>;

    /// Reads the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// In-process store, for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, String>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, payload: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), payload.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

/// SQLite-backed store.
///
/// Uses WAL mode for file databases and runs migrations on open.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Opens (creating if needed) the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails,
    /// or [`StoreError::Migration`] if migrations fail.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Gracefully closes all connections in the pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn put(&self, key: &str, payload: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_state (state_key, payload, updated_at) \
             VALUES (?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(state_key) DO UPDATE SET \
             payload = excluded.payload, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM session_state WHERE state_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(payload,)| payload))
    }
}
