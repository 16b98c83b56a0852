//! # Memory Store
//!
//! In-process store on top of Moka, bounded by entry count.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use moka::future::Cache as MokaCache;
use tracing::debug;

use crate::storage::provider::ObjectStore;
use crate::storage::types::{StoreLookup, StoreResult, StoredMetadata};

#[derive(Clone)]
struct StoredEntry {
    data: Bytes,
    metadata: StoredMetadata,
}

#[derive(Clone)]
pub struct MemoryStore {
    cache: MokaCache<String, StoredEntry>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryStore {
    /// Store holding at most `max_objects` entries. Moka evicts on its own
    /// once the bound is hit; `evict_lru` enforces tighter limits on demand.
    pub fn new(max_objects: u64) -> Self {
        let cache = MokaCache::builder().max_capacity(max_objects.max(1)).build();
        debug!(max_objects, "Memory store created");
        Self { cache }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreLookup {
        let Some(mut entry) = self.cache.get(key).await else {
            return Ok(None);
        };
        entry.metadata.touched_at = Utc::now();
        self.cache.insert(key.to_string(), entry.clone()).await;
        Ok(Some((entry.data, entry.metadata)))
    }

    async fn put(&self, key: &str, data: Bytes, mut metadata: StoredMetadata) -> StoreResult<()> {
        metadata.touched_at = Utc::now();
        metadata.size = data.len() as u64;
        self.cache
            .insert(key.to_string(), StoredEntry { data, metadata })
            .await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        self.cache.run_pending_tasks().await;
        Ok(self.cache.entry_count() as usize)
    }

    async fn evict_lru(&self, max_objects: usize) -> StoreResult<usize> {
        self.cache.run_pending_tasks().await;

        let mut entries: Vec<_> = self
            .cache
            .iter()
            .map(|(key, entry)| (key, entry.metadata.touched_at))
            .collect();
        if entries.len() <= max_objects {
            return Ok(0);
        }

        entries.sort_by_key(|(_, touched_at)| *touched_at);
        let excess = entries.len() - max_objects;
        for (key, _) in entries.iter().take(excess) {
            self.cache.invalidate(key.as_str()).await;
        }
        self.cache.run_pending_tasks().await;

        debug!(evicted = excess, max_objects, "Evicted least recently used objects");
        Ok(excess)
    }
}
