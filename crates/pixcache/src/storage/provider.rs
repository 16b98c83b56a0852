use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::types::{StoreLookup, StoreResult, StoredMetadata};

/// Key/value store holding the objects of one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Look up an entry, marking it as recently used
    async fn get(&self, key: &str) -> StoreLookup;

    /// Insert or replace an entry
    async fn put(&self, key: &str, data: Bytes, metadata: StoredMetadata) -> StoreResult<()>;

    /// Remove an entry; missing keys are not an error
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Remove every entry
    async fn clear(&self) -> StoreResult<()>;

    /// Number of stored entries
    async fn len(&self) -> StoreResult<usize>;

    /// Drop least recently used entries until at most `max_objects` remain.
    /// Returns how many entries were removed.
    async fn evict_lru(&self, max_objects: usize) -> StoreResult<usize>;
}
