//! # Storage Manager
//!
//! Per-bucket coordinator between the object store and the network. Fresh
//! entries are served from the store, entries past `valid_till` are
//! revalidated with conditional requests, and entries past the bucket's
//! `stale_after` window are downloaded again from scratch.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{FetchError, RegistryError};
use crate::fetcher::{FetchResponse, ResilientFetcher, ResponseMeta};
use crate::policy::{Bucket, BucketPolicy};
use crate::storage::provider::ObjectStore;
use crate::storage::types::{CachedObject, Freshness, ObjectSource, StoredMetadata};

/// Storage manager for one bucket
pub struct StorageManager {
    bucket: Bucket,
    store: Arc<dyn ObjectStore>,
    fetcher: ResilientFetcher,
    downloads: Arc<Semaphore>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("bucket", &self.bucket)
            .field("policy", self.fetcher.policy())
            .field("available_downloads", &self.downloads.available_permits())
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    pub fn new(bucket: Bucket, store: Arc<dyn ObjectStore>, fetcher: ResilientFetcher) -> Self {
        let permits = fetcher.policy().max_concurrent_fetches.max(1);
        Self {
            bucket,
            store,
            fetcher,
            downloads: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    pub fn policy(&self) -> &BucketPolicy {
        self.fetcher.policy()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn available_downloads(&self) -> usize {
        self.downloads.available_permits()
    }

    /// Bytes for `key`, going to the network for `url` when the stored copy
    /// is missing or no longer fresh.
    pub async fn get_bytes(
        &self,
        url: &str,
        key: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<CachedObject, RegistryError> {
        let stored = match self.store.get(key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(bucket = %self.bucket, key, error = %e, "Store lookup failed, treating as miss");
                None
            }
        };

        let Some((bytes, metadata)) = stored else {
            debug!(bucket = %self.bucket, key, "Cache miss");
            return self.download(url, key, headers).await;
        };

        match metadata.freshness(Utc::now(), self.policy().stale_after) {
            Freshness::Fresh => Ok(CachedObject {
                bytes,
                metadata,
                source: ObjectSource::Storage,
            }),
            Freshness::NeedsRevalidation if metadata.has_validator() => {
                self.revalidate(url, key, headers, bytes, metadata).await
            }
            Freshness::NeedsRevalidation | Freshness::Stale => {
                debug!(bucket = %self.bucket, key, "Stored entry too old, downloading again");
                self.download(url, key, headers).await
            }
        }
    }

    /// Remove one entry.
    pub async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        Ok(self.store.remove(key).await?)
    }

    /// Remove every entry of the bucket.
    pub async fn clear(&self) -> Result<(), RegistryError> {
        self.store.clear().await?;
        debug!(bucket = %self.bucket, "Bucket cleared");
        Ok(())
    }

    async fn revalidate(
        &self,
        url: &str,
        key: &str,
        headers: Option<&HeaderMap>,
        bytes: Bytes,
        mut metadata: StoredMetadata,
    ) -> Result<CachedObject, RegistryError> {
        let mut conditional = headers.cloned().unwrap_or_default();
        if let Some(value) = metadata
            .etag
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            conditional.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = metadata
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            conditional.insert(IF_MODIFIED_SINCE, value);
        }

        let _permit = self.acquire_download().await?;
        let response = self.fetcher.fetch(url, Some(&conditional)).await?;
        if !response.is_not_modified() {
            return self.ingest(url, key, response).await;
        }

        let source = if response.is_stale() {
            ObjectSource::StaleIfError
        } else {
            metadata.stored_at = Utc::now();
            if let Some(etag) = response.etag() {
                metadata.etag = Some(etag.to_string());
            }
            ObjectSource::Revalidated
        };
        metadata.valid_till = response.valid_till();

        if let Err(e) = self.store.put(key, bytes.clone(), metadata.clone()).await {
            warn!(bucket = %self.bucket, key, error = %e, "Failed to refresh stored metadata");
        }
        debug!(bucket = %self.bucket, key, ?source, valid_till = %metadata.valid_till, "Revalidated entry");

        Ok(CachedObject {
            bytes,
            metadata,
            source,
        })
    }

    async fn download(
        &self,
        url: &str,
        key: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<CachedObject, RegistryError> {
        let _permit = self.acquire_download().await?;
        let response = self.fetcher.fetch(url, headers).await?;
        self.ingest(url, key, response).await
    }

    /// Collect a full response body and persist it.
    async fn ingest(
        &self,
        url: &str,
        key: &str,
        response: FetchResponse,
    ) -> Result<CachedObject, RegistryError> {
        if response.is_not_modified() {
            // Nothing stored to refer to; the caller's own validators were answered.
            return Err(FetchError::Status(response.status_code()).into());
        }

        let mut metadata = StoredMetadata::new(key, url, 0)
            .with_valid_till(response.valid_till())
            .with_etag_option(response.etag().map(str::to_string))
            .with_last_modified_option(response.last_modified().map(str::to_string))
            .with_file_extension(response.file_extension());
        let bytes = response.bytes().await?;
        metadata.size = bytes.len() as u64;

        match self.store.put(key, bytes.clone(), metadata.clone()).await {
            Ok(()) => {
                let max_objects = self.policy().max_objects;
                match self.store.evict_lru(max_objects).await {
                    Ok(0) => {}
                    Ok(evicted) => debug!(bucket = %self.bucket, evicted, "Evicted old objects"),
                    Err(e) => warn!(bucket = %self.bucket, error = %e, "Eviction failed"),
                }
            }
            Err(e) => warn!(bucket = %self.bucket, key, error = %e, "Failed to store object"),
        }

        Ok(CachedObject {
            bytes,
            metadata,
            source: ObjectSource::Network,
        })
    }

    async fn acquire_download(&self) -> Result<tokio::sync::OwnedSemaphorePermit, FetchError> {
        self.downloads
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transport(format!("{} download limiter closed", self.bucket)))
    }
}
