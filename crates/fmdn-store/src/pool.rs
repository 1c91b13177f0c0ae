//! # SQLite Store
//!
//! Connection pool creation and the SQLite-backed [`KeyValueStore`].
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  StoreConfig::new(path) ← Configure pool settings                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SqliteStore::new(config).await ← Create pool + run migrations         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │            SqlitePool                    │                           │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐               │  (max_connections)        │
//! │  │  │Conn1│ │Conn2│ │Conn3│ ...           │                           │
//! │  │  └─────┘ └─────┘ └─────┘               │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │       │                                                                 │
//! │       │ one supervisor per tenant writes concurrently                  │
//! │       ▼                                                                 │
//! │  kv_store (namespace, key) → value                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::kv::KeyValueStore;
use crate::migrations;

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// SQLite store configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = StoreConfig::new("/var/lib/fmdn/fmdn.db").max_connections(2);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,

    /// Pool ceiling (default 4). Writers are one supervisor per tenant.
    pub max_connections: u32,

    pub min_connections: u32,

    /// Acquire timeout (default 30s).
    pub connect_timeout: Duration,

    pub idle_timeout: Duration,

    /// Apply embedded migrations when opening (default on).
    pub run_migrations: bool,
}

impl StoreConfig {
    /// Creates a configuration for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory configuration (for testing).
    pub fn in_memory() -> Self {
        StoreConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            // Every connection would get its own empty database.
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
            run_migrations: true,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }
}

// =============================================================================
// SqliteStore
// =============================================================================

/// [`KeyValueStore`] backed by a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database and runs migrations.
    pub async fn new(config: StoreConfig) -> StoreResult<Self> {
        info!(path = %config.database_path.display(), "Opening key-value store");

        let connect_options = if config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
                }
            }
            let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());
            SqliteConnectOptions::from_str(&connect_url)
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
                // Readers don't block the writer
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        info!(max_connections = config.max_connections, "Store pool created");

        let store = SqliteStore { pool };
        if config.run_migrations {
            migrations::run_migrations(&store.pool).await?;
        }
        Ok(store)
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool. Later operations fail with [`StoreError::Closed`].
    pub async fn close(&self) {
        info!("Closing key-value store");
        self.pool.close().await;
    }

    /// Returns true if the database answers queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_store WHERE namespace = ?1 AND key = ?2")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!(namespace, key, "Stored value");
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = ?1 AND key = ?2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = SqliteStore::new(StoreConfig::in_memory()).await.unwrap();
        assert!(store.health_check().await);

        let (total, applied) = migrations::migration_status(store.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = SqliteStore::new(StoreConfig::in_memory()).await.unwrap();
        assert_eq!(store.get("alice", "fcm_credentials").await.unwrap(), None);

        store.set("alice", "fcm_credentials", "{\"v\":1}").await.unwrap();
        store.set("alice", "fcm_credentials", "{\"v\":2}").await.unwrap();
        store.set("bob", "fcm_credentials", "{\"v\":3}").await.unwrap();

        assert_eq!(
            store.get("alice", "fcm_credentials").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );
        assert_eq!(
            store.get("bob", "fcm_credentials").await.unwrap().as_deref(),
            Some("{\"v\":3}")
        );

        store.delete("alice", "fcm_credentials").await.unwrap();
        assert_eq!(store.get("alice", "fcm_credentials").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_store_errors() {
        let store = SqliteStore::new(StoreConfig::in_memory()).await.unwrap();
        store.close().await;
        assert!(matches!(store.get("a", "b").await, Err(StoreError::Closed)));
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/fmdn.db").max_connections(8).run_migrations(false);
        assert_eq!(config.max_connections, 8);
        assert!(!config.run_migrations);
        assert!(!config.is_in_memory());
        assert!(StoreConfig::in_memory().is_in_memory());
    }
}
