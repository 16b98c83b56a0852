//! # File Store
//!
//! One data file plus a JSON sidecar per key, inside the bucket directory.
//! Recency is tracked in memory; the sidecars are only scanned once, the
//! first time the store needs to count or evict.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::storage::provider::ObjectStore;
use crate::storage::types::{StoreLookup, StoreResult, StoredMetadata};

const DATA_EXTENSION: &str = "bin";
const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    initialized: Arc<AtomicBool>,
    write_seq: Arc<AtomicU64>,
    /// Last access time per file stem
    index: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    indexed: Arc<OnceCell<()>>,
}

impl FileStore {
    /// Store rooted at `dir`. The directory is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
            write_seq: Arc::new(AtomicU64::new(0)),
            index: Arc::new(Mutex::new(HashMap::new())),
            indexed: Arc::new(OnceCell::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn file_stem(key: &str) -> String {
        let hash = Sha256::digest(key.as_bytes());
        format!("{hash:x}")
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(Self::file_stem(key))
            .with_extension(DATA_EXTENSION)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(Self::file_stem(key))
            .with_extension(META_EXTENSION)
    }

    fn touch(&self, key: &str, at: DateTime<Utc>) {
        self.index.lock().insert(Self::file_stem(key), at);
    }

    fn forget(&self, key: &str) {
        self.index.lock().remove(&Self::file_stem(key));
    }

    /// Fill the index from the sidecars on disk, once per store.
    async fn ensure_index(&self) -> io::Result<()> {
        self.indexed
            .get_or_try_init(|| async {
                let entries = self.scan().await?;
                let mut index = self.index.lock();
                for (meta_path, metadata) in entries {
                    if let Some(stem) = meta_path.file_stem().and_then(|s| s.to_str()) {
                        // Accesses recorded while scanning are newer.
                        index.entry(stem.to_string()).or_insert(metadata.touched_at);
                    }
                }
                debug!(dir = ?self.dir, entries = index.len(), "Loaded store index");
                Ok::<_, io::Error>(())
            })
            .await
            .map(|_| ())
    }

    fn temp_path(&self, target: &Path) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{seq}.tmp"));
        target.with_file_name(name)
    }

    /// Write `contents` to `target` through a temporary file and a rename.
    async fn write_atomic(&self, target: &Path, contents: &[u8]) -> io::Result<()> {
        let temp = self.temp_path(target);
        if let Err(e) = fs::write(&temp, contents).await {
            warn!(path = ?temp, error = %e, "Failed to write temporary file");
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, target).await {
            warn!(from = ?temp, to = ?target, error = %e, "Failed to rename temporary file");
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }

    async fn write_metadata(&self, key: &str, metadata: &StoredMetadata) -> io::Result<()> {
        let json = serde_json::to_vec(metadata).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize metadata: {e}"),
            )
        })?;
        self.write_atomic(&self.meta_path(key), &json).await
    }

    async fn remove_pair(data_path: &Path, meta_path: &Path) -> io::Result<()> {
        let data_result = fs::remove_file(data_path).await;
        let meta_result = fs::remove_file(meta_path).await;
        match (data_result, meta_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => Err(e),
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Metadata of every entry, with the stem each one is stored under.
    /// Unreadable sidecars are deleted together with their data file.
    async fn scan(&self) -> io::Result<Vec<(PathBuf, StoredMetadata)>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            let parsed = fs::read(&path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<StoredMetadata>(&bytes).ok());
            match parsed {
                Some(metadata) => found.push((path, metadata)),
                None => {
                    warn!(path = ?path, "Dropping unreadable metadata sidecar");
                    let _ = Self::remove_pair(&path.with_extension(DATA_EXTENSION), &path).await;
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get(&self, key: &str) -> StoreLookup {
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read metadata file");
                return Ok(None);
            }
        };

        let mut metadata: StoredMetadata = match serde_json::from_slice(&metadata_bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse metadata, dropping entry");
                let _ = Self::remove_pair(&data_path, &meta_path).await;
                self.forget(key);
                return Ok(None);
            }
        };

        let data = match fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = ?data_path, error = %e, "Failed to read data file, dropping entry");
                let _ = Self::remove_pair(&data_path, &meta_path).await;
                self.forget(key);
                return Ok(None);
            }
        };

        metadata.touched_at = Utc::now();
        self.touch(key, metadata.touched_at);
        if let Err(e) = self.write_metadata(key, &metadata).await {
            debug!(key, error = %e, "Failed to record access time");
        }

        Ok(Some((Bytes::from(data), metadata)))
    }

    async fn put(&self, key: &str, data: Bytes, mut metadata: StoredMetadata) -> StoreResult<()> {
        self.ensure_initialized().await?;

        metadata.touched_at = Utc::now();
        metadata.size = data.len() as u64;

        let data_path = self.data_path(key);
        self.write_atomic(&data_path, &data).await?;
        if let Err(e) = self.write_metadata(key, &metadata).await {
            let _ = fs::remove_file(&data_path).await;
            return Err(e);
        }
        self.touch(key, metadata.touched_at);

        debug!(key, size = metadata.size, dir = ?self.dir, "Stored object");
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);
        Self::remove_pair(&data_path, &meta_path).await.inspect_err(|e| {
            warn!(key, error = %e, "Failed to remove stored object");
        })?;
        self.forget(key);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.index.lock().clear();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "Failed to read store directory");
                return Err(e);
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove store entry"),
            }
        }

        debug!(dir = ?self.dir, removed, "Cleared store");
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        self.ensure_index().await?;
        Ok(self.index.lock().len())
    }

    async fn evict_lru(&self, max_objects: usize) -> StoreResult<usize> {
        self.ensure_index().await?;
        let victims: Vec<String> = {
            let index = self.index.lock();
            if index.len() <= max_objects {
                return Ok(0);
            }
            let mut entries: Vec<(&String, &DateTime<Utc>)> = index.iter().collect();
            entries.sort_by_key(|(_, touched_at)| **touched_at);
            let excess = index.len() - max_objects;
            entries
                .into_iter()
                .take(excess)
                .map(|(stem, _)| stem.clone())
                .collect()
        };

        let mut evicted = 0;
        for stem in victims {
            let data_path = self.dir.join(&stem).with_extension(DATA_EXTENSION);
            let meta_path = self.dir.join(&stem).with_extension(META_EXTENSION);
            match Self::remove_pair(&data_path, &meta_path).await {
                Ok(()) => {
                    self.index.lock().remove(&stem);
                    evicted += 1;
                }
                Err(e) => warn!(stem = %stem, error = %e, "Failed to evict object"),
            }
        }

        debug!(dir = ?self.dir, evicted, max_objects, "Evicted least recently used objects");
        Ok(evicted)
    }
}
