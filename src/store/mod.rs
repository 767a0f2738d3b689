//! Durable append-only update logs ("YStores").
//!
//! A store keeps `(update, metadata, timestamp)` triples per document path
//! and can replay them onto a fresh document. Two backends exist: one file
//! per document ([`FileYStore`]) and a shared SQLite database
//! ([`SQLiteYStore`]). Both optionally squash a document's history into a
//! single update once its latest entry is older than the configured
//! time-to-live.

mod file;
mod sqlite;

pub use file::{FileYStore, FILE_STORE_VERSION};
pub use sqlite::{SQLiteYStore, SQLITE_STORE_VERSION};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::ydoc::YDocHandle;

/// Async callback producing the metadata stored next to each update.
pub type MetadataCallback = Arc<dyn Fn() -> BoxFuture<'static, Vec<u8>> + Send + Sync>;

/// Value-typed store configuration.
#[derive(Clone, Default)]
pub struct YStoreConfig {
    /// Database file (SQLite) or root directory (file backend).
    pub path: PathBuf,
    /// How recent a document's latest update must be before its history is
    /// squashed into a single update. `None` never squashes.
    pub document_ttl: Option<Duration>,
    /// Metadata producer; updates are stored with empty metadata when unset.
    pub metadata_callback: Option<MetadataCallback>,
}

impl YStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document_ttl: None,
            metadata_callback: None,
        }
    }

    pub fn document_ttl(mut self, ttl: Duration) -> Self {
        self.document_ttl = Some(ttl);
        self
    }

    pub fn metadata_callback(mut self, callback: MetadataCallback) -> Self {
        self.metadata_callback = Some(callback);
        self
    }
}

/// One entry of a document's update log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUpdate {
    pub update: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Wall-clock seconds since the unix epoch at write time.
    pub timestamp: f64,
}

/// Document record as kept by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocInfo {
    pub path: String,
    pub version: i64,
}

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("the document {0} already exists")]
    DocExists(String),
    #[error("the document {0} does not exist")]
    DocNotFound(String),
    #[error("store has not been initialized")]
    NotInitialized,
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Contract shared by every store backend.
///
/// All operations are async; writers are serialized by a per-store lock.
#[async_trait]
pub trait YStore: Send + Sync {
    /// Create or migrate the backing storage. On a schema version mismatch
    /// the existing artifact is renamed to a non-colliding sibling and a
    /// fresh store is created in its place; nothing is ever deleted.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Whether a document exists under `path`.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Paths of all stored documents.
    fn list(&self) -> BoxStream<'static, Result<String, StoreError>>;

    /// The document's record, or `None` when unknown.
    async fn get(&self, path: &str) -> Result<Option<DocInfo>, StoreError>;

    /// Create a new document record. Fails with [`StoreError::DocExists`]
    /// when one already exists under `path`.
    async fn create(&self, path: &str, version: i64) -> Result<(), StoreError>;

    /// Remove a document and its updates. Removing an unknown path succeeds.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Append one update, stamped with the metadata callback's output and
    /// the current wall clock. Triggers a history squash first when the
    /// document's latest entry is older than the configured time-to-live.
    async fn write(&self, path: &str, update: &[u8]) -> Result<(), StoreError>;

    /// The document's updates in timestamp order (ties in insertion order).
    /// Fails with [`StoreError::DocNotFound`] when `path` holds no updates.
    fn read(&self, path: &str) -> BoxStream<'static, Result<StoredUpdate, StoreError>>;

    /// Store the document's full state as a single update.
    async fn encode_state_as_update(
        &self,
        path: &str,
        doc: &YDocHandle,
    ) -> Result<(), StoreError> {
        self.write(path, &doc.encode_state_as_update()).await
    }

    /// Replay every stored update onto `doc`.
    async fn apply_updates(&self, path: &str, doc: &YDocHandle) -> Result<(), StoreError> {
        let mut updates = self.read(path);
        while let Some(stored) = updates.next().await {
            let stored = stored?;
            doc.apply_update(&stored.update)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        }
        Ok(())
    }
}

/// Seconds since the unix epoch as a float, the storage timestamp format.
pub(crate) fn timestamp_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Resolve the configured metadata callback, defaulting to empty metadata.
pub(crate) async fn resolve_metadata(config: &YStoreConfig) -> Vec<u8> {
    match &config.metadata_callback {
        Some(callback) => callback().await,
        None => Vec::new(),
    }
}

/// First non-colliding sibling of `path`: `name(1).ext`, `name(2).ext`, …
pub(crate) async fn get_new_path(path: &Path) -> Result<PathBuf, StoreError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ystore");
    let ext = path.extension().and_then(|s| s.to_str());
    let mut i = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{}({}).{}", stem, i, ext),
            None => format!("{}({})", stem, i),
        };
        let candidate = path.with_file_name(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_new_path_skips_taken_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("store.db");
        tokio::fs::write(&base, b"").await.unwrap();

        let first = get_new_path(&base).await.unwrap();
        assert_eq!(first, dir.path().join("store(1).db"));

        tokio::fs::write(&first, b"").await.unwrap();
        let second = get_new_path(&base).await.unwrap();
        assert_eq!(second, dir.path().join("store(2).db"));
    }

    #[tokio::test]
    async fn test_get_new_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("store");
        tokio::fs::create_dir(&base).await.unwrap();

        let first = get_new_path(&base).await.unwrap();
        assert_eq!(first, dir.path().join("store(1)"));
    }
}
