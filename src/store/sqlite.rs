//! SQLite-backed store: the update logs of all documents share one database.
//!
//! Schema:
//! ```sql
//! documents(path TEXT PRIMARY KEY, version INTEGER NOT NULL)
//! yupdates(path TEXT NOT NULL, yupdate BLOB, metadata BLOB, timestamp REAL NOT NULL)
//! INDEX idx_yupdates_path_timestamp ON yupdates(path, timestamp)
//! PRAGMA user_version = 3
//! ```

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::warn;

use crate::ydoc::YDocHandle;

use super::{
    get_new_path, resolve_metadata, timestamp_now, DocInfo, StoreError, StoredUpdate, YStore,
    YStoreConfig,
};

/// Schema version carried in `PRAGMA user_version`.
pub const SQLITE_STORE_VERSION: i64 = 3;

/// A store which uses a shared SQLite database. Multiple rooms may write to
/// the same store; all writers serialize on the per-store lock.
pub struct SQLiteYStore {
    config: YStoreConfig,
    lock: Arc<Mutex<()>>,
    pool: OnceLock<SqlitePool>,
}

impl SQLiteYStore {
    pub fn new(config: YStoreConfig) -> Self {
        Self {
            config,
            lock: Arc::new(Mutex::new(())),
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> Result<SqlitePool, StoreError> {
        self.pool.get().cloned().ok_or(StoreError::NotInitialized)
    }

    /// Move an existing database with a foreign schema version aside.
    async fn migrate_stale_database(&self) -> Result<(), StoreError> {
        let db_path = &self.config.path;
        if !tokio::fs::try_exists(db_path).await? {
            return Ok(());
        }
        let probe = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(db_path))
            .await?;
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'yupdates'",
        )
        .fetch_one(&probe)
        .await?;
        let mut stale = false;
        if tables > 0 {
            let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
                .fetch_one(&probe)
                .await?;
            stale = version != SQLITE_STORE_VERSION;
        }
        probe.close().await;
        if stale {
            let new_path = get_new_path(db_path).await?;
            warn!(
                from = %db_path.display(),
                to = %new_path.display(),
                "YStore version mismatch, moving database aside"
            );
            tokio::fs::rename(db_path, &new_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl YStore for SQLiteYStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        if self.pool.get().is_some() {
            return Ok(());
        }

        self.migrate_stale_database().await?;

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&self.config.path)
                    .create_if_missing(true),
            )
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (path TEXT PRIMARY KEY, version INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS yupdates \
             (path TEXT NOT NULL, yupdate BLOB, metadata BLOB, timestamp REAL NOT NULL)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_yupdates_path_timestamp ON yupdates (path, timestamp)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(&format!("PRAGMA user_version = {}", SQLITE_STORE_VERSION))
            .execute(&pool)
            .await?;

        // initialize() holds the lock, so no competing set can have happened
        let _ = self.pool.set(pool);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&pool)
            .await?;
        Ok(row.is_some())
    }

    fn list(&self) -> BoxStream<'static, Result<String, StoreError>> {
        let pool = self.pool();
        Box::pin(async_stream::try_stream! {
            let pool = pool?;
            let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM documents")
                .fetch_all(&pool)
                .await?;
            for (path,) in rows {
                yield path;
            }
        })
    }

    async fn get(&self, path: &str) -> Result<Option<DocInfo>, StoreError> {
        let pool = self.pool()?;
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT path, version FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&pool)
                .await?;
        Ok(row.map(|(path, version)| DocInfo { path, version }))
    }

    async fn create(&self, path: &str, version: i64) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let _guard = self.lock.lock().await;
        let existing: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&pool)
            .await?;
        if existing.is_some() {
            return Err(StoreError::DocExists(path.to_string()));
        }
        sqlx::query("INSERT INTO documents (path, version) VALUES (?, ?)")
            .bind(path)
            .bind(version)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let _guard = self.lock.lock().await;
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM yupdates WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write(&self, path: &str, update: &[u8]) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let _guard = self.lock.lock().await;
        let mut tx = pool.begin().await?;

        let known: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            sqlx::query("INSERT INTO documents (path, version) VALUES (?, 0)")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(ttl) = self.config.document_ttl {
            let last: Option<(f64,)> = sqlx::query_as(
                "SELECT timestamp FROM yupdates WHERE path = ? \
                 ORDER BY timestamp DESC LIMIT 1",
            )
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
            let expired = last
                .is_some_and(|(last_ts,)| timestamp_now() - last_ts > ttl.as_secs_f64());
            if expired {
                // squash history into a single update, in the same
                // transaction as the append
                let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
                    "SELECT yupdate FROM yupdates WHERE path = ? \
                     ORDER BY timestamp ASC, rowid ASC",
                )
                .bind(path)
                .fetch_all(&mut *tx)
                .await?;
                let scratch = YDocHandle::new();
                for (stored,) in &rows {
                    scratch
                        .apply_update(stored)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                }
                sqlx::query("DELETE FROM yupdates WHERE path = ?")
                    .bind(path)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("INSERT INTO yupdates VALUES (?, ?, ?, ?)")
                    .bind(path)
                    .bind(scratch.encode_state_as_update())
                    .bind(resolve_metadata(&self.config).await)
                    .bind(timestamp_now())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("INSERT INTO yupdates VALUES (?, ?, ?, ?)")
            .bind(path)
            .bind(update)
            .bind(resolve_metadata(&self.config).await)
            .bind(timestamp_now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    fn read(&self, path: &str) -> BoxStream<'static, Result<StoredUpdate, StoreError>> {
        let pool = self.pool();
        let lock = self.lock.clone();
        let path = path.to_string();
        Box::pin(async_stream::try_stream! {
            let pool = pool?;
            let rows: Vec<(Vec<u8>, Vec<u8>, f64)> = {
                let _guard = lock.lock().await;
                sqlx::query_as(
                    "SELECT yupdate, metadata, timestamp FROM yupdates WHERE path = ? \
                     ORDER BY timestamp ASC, rowid ASC",
                )
                .bind(path.as_str())
                .fetch_all(&pool)
                .await?
            };
            if rows.is_empty() {
                Err(StoreError::DocNotFound(path.clone()))?;
            }
            for (update, metadata, timestamp) in rows {
                yield StoredUpdate { update, metadata, timestamp };
            }
        })
    }
}
