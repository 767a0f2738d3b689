//! File-backed store: one update log per document under a common root.
//!
//! Layout: `<root>/__version__` holds the store schema version; each
//! document lives at `<root>/<path>.y`, starting with a `VERSION:<n>\n`
//! header (the document's version) followed by a concatenation of
//! `varuint(len)||update  varuint(len)||metadata  varuint(len)||f64_le(ts)`
//! triples.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::protocol::{write_var_bytes, Decoder};
use crate::ydoc::YDocHandle;

use super::{
    get_new_path, resolve_metadata, timestamp_now, DocInfo, StoreError, StoredUpdate, YStore,
    YStoreConfig,
};

/// Schema version of the file layout.
pub const FILE_STORE_VERSION: i64 = 2;

const VERSION_FILE: &str = "__version__";
const DOC_SUFFIX: &str = ".y";

/// A store which uses one file per document.
pub struct FileYStore {
    config: YStoreConfig,
    lock: Arc<Mutex<()>>,
}

impl FileYStore {
    pub fn new(config: YStoreConfig) -> Self {
        Self {
            config,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn doc_file(&self, path: &str) -> PathBuf {
        doc_file(&self.config.path, path)
    }

    /// Create the root and stamp the store version if absent.
    async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.config.path).await?;
        let version_file = self.config.path.join(VERSION_FILE);
        if !tokio::fs::try_exists(&version_file).await? {
            tokio::fs::write(&version_file, format!("{}\n", FILE_STORE_VERSION)).await?;
        }
        Ok(())
    }

    /// Load and decode a document file. `Ok(None)` when the file is absent.
    async fn load(&self, path: &str) -> Result<Option<(i64, Vec<StoredUpdate>)>, StoreError> {
        let file_path = self.doc_file(path);
        let data = match tokio::fs::read(&file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (version, offset) = parse_header(&data)?;
        let triples = decode_triples(&data[offset..])?;
        Ok(Some((version, triples)))
    }
}

#[async_trait]
impl YStore for FileYStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let root = &self.config.path;
        let version_file = root.join(VERSION_FILE);
        if tokio::fs::try_exists(&version_file).await? {
            let contents = tokio::fs::read_to_string(&version_file).await?;
            let version: i64 = contents.trim().parse().map_err(|_| {
                StoreError::Corrupt(format!("unreadable store version {:?}", contents.trim()))
            })?;
            if version != FILE_STORE_VERSION {
                let new_root = get_new_path(root).await?;
                warn!(
                    from = %root.display(),
                    to = %new_root.display(),
                    "YStore version mismatch, moving store aside"
                );
                tokio::fs::rename(root, &new_root).await?;
            }
        }
        self.ensure_root().await
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(&self.doc_file(path)).await?)
    }

    fn list(&self) -> BoxStream<'static, Result<String, StoreError>> {
        let root = self.config.path.clone();
        Box::pin(async_stream::try_stream! {
            let mut pending = vec![root.clone()];
            while let Some(dir) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => Err(e)?,
                };
                while let Some(entry) = entries.next_entry().await? {
                    let entry_path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        pending.push(entry_path);
                        continue;
                    }
                    let Ok(relative) = entry_path.strip_prefix(&root) else {
                        continue;
                    };
                    let name = relative.to_string_lossy().into_owned();
                    if let Some(doc_path) = name.strip_suffix(DOC_SUFFIX) {
                        yield doc_path.to_string();
                    }
                }
            }
        })
    }

    async fn get(&self, path: &str) -> Result<Option<DocInfo>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load(path).await?.map(|(version, _)| DocInfo {
            path: path.to_string(),
            version,
        }))
    }

    async fn create(&self, path: &str, version: i64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;
        let file_path = self.doc_file(path);
        if tokio::fs::try_exists(&file_path).await? {
            return Err(StoreError::DocExists(path.to_string()));
        }
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file_path, header(version)).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.doc_file(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, update: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;
        let file_path = self.doc_file(path);

        if !tokio::fs::try_exists(&file_path).await? {
            if let Some(parent) = file_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&file_path, header(0)).await?;
        } else if let Some(ttl) = self.config.document_ttl {
            // squash expired history before appending, inside the same
            // locked section so readers never observe a partial state
            if let Some((version, triples)) = self.load(path).await? {
                let expired = triples
                    .last()
                    .is_some_and(|last| timestamp_now() - last.timestamp > ttl.as_secs_f64());
                if expired {
                    let scratch = YDocHandle::new();
                    for stored in &triples {
                        scratch
                            .apply_update(&stored.update)
                            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    }
                    let mut contents = header(version).into_bytes();
                    encode_triple(
                        &scratch.encode_state_as_update(),
                        &resolve_metadata(&self.config).await,
                        timestamp_now(),
                        &mut contents,
                    );
                    tokio::fs::write(&file_path, contents).await?;
                }
            }
        }

        let mut buf = Vec::with_capacity(update.len() + 32);
        encode_triple(
            update,
            &resolve_metadata(&self.config).await,
            timestamp_now(),
            &mut buf,
        );
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&file_path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    fn read(&self, path: &str) -> BoxStream<'static, Result<StoredUpdate, StoreError>> {
        let root = self.config.path.clone();
        let lock = self.lock.clone();
        let path = path.to_string();
        Box::pin(async_stream::try_stream! {
            let data = {
                let _guard = lock.lock().await;
                match tokio::fs::read(doc_file(&root, &path)).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(StoreError::DocNotFound(path.clone()))?
                    }
                    Err(e) => Err(StoreError::Io(e))?,
                }
            };
            let (_version, offset) = parse_header(&data)?;
            let triples = decode_triples(&data[offset..])?;
            if triples.is_empty() {
                Err(StoreError::DocNotFound(path.clone()))?;
            }
            for stored in triples {
                yield stored;
            }
        })
    }
}

fn doc_file(root: &std::path::Path, path: &str) -> PathBuf {
    root.join(format!("{}{}", path.trim_start_matches('/'), DOC_SUFFIX))
}

fn header(version: i64) -> String {
    format!("VERSION:{}\n", version)
}

/// Parse the `VERSION:<n>\n` header; returns the version and the offset
/// where the triples start.
fn parse_header(data: &[u8]) -> Result<(i64, usize), StoreError> {
    let corrupt = || StoreError::Corrupt("missing VERSION header".to_string());
    let rest = data.strip_prefix(b"VERSION:").ok_or_else(corrupt)?;
    let newline = rest.iter().position(|&b| b == b'\n').ok_or_else(corrupt)?;
    let version = std::str::from_utf8(&rest[..newline])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(corrupt)?;
    Ok((version, "VERSION:".len() + newline + 1))
}

fn encode_triple(update: &[u8], metadata: &[u8], timestamp: f64, out: &mut Vec<u8>) {
    write_var_bytes(update, out);
    write_var_bytes(metadata, out);
    write_var_bytes(&timestamp.to_le_bytes(), out);
}

fn decode_triples(data: &[u8]) -> Result<Vec<StoredUpdate>, StoreError> {
    let corrupt = |e: crate::protocol::ProtocolError| StoreError::Corrupt(e.to_string());
    let truncated = || StoreError::Corrupt("truncated update triple".to_string());
    let mut decoder = Decoder::new(data);
    let mut out = Vec::new();
    loop {
        let update = match decoder.read_message().map_err(corrupt)? {
            Some(update) => update.to_vec(),
            None => break,
        };
        let metadata = decoder
            .read_message()
            .map_err(corrupt)?
            .ok_or_else(truncated)?
            .to_vec();
        let ts_bytes = decoder
            .read_message()
            .map_err(corrupt)?
            .ok_or_else(truncated)?;
        if ts_bytes.len() != 8 {
            return Err(StoreError::Corrupt(format!(
                "timestamp must be 8 bytes, got {}",
                ts_bytes.len()
            )));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(ts_bytes);
        out.push(StoredUpdate {
            update,
            metadata,
            timestamp: f64::from_le_bytes(raw),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let data = header(2).into_bytes();
        let (version, offset) = parse_header(&data).unwrap();
        assert_eq!(version, 2);
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(parse_header(b"NOPE:2\n").is_err());
        assert!(parse_header(b"VERSION:2").is_err());
        assert!(parse_header(b"VERSION:x\n").is_err());
    }

    #[test]
    fn test_triple_roundtrip() {
        let mut buf = Vec::new();
        encode_triple(b"update", b"", 12.5, &mut buf);
        encode_triple(b"more", b"meta", 13.0, &mut buf);

        let triples = decode_triples(&buf).unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].update, b"update");
        assert_eq!(triples[0].metadata, b"");
        assert_eq!(triples[0].timestamp, 12.5);
        assert_eq!(triples[1].update, b"more");
        assert_eq!(triples[1].metadata, b"meta");
        assert_eq!(triples[1].timestamp, 13.0);
    }

    #[test]
    fn test_truncated_triple_is_corrupt() {
        let mut buf = Vec::new();
        write_var_bytes(b"update", &mut buf);
        assert!(matches!(
            decode_triples(&buf),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_doc_file_strips_leading_slash() {
        let root = std::path::Path::new("/tmp/store");
        assert_eq!(
            doc_file(root, "/room/doc.txt"),
            PathBuf::from("/tmp/store/room/doc.txt.y")
        );
    }
}
