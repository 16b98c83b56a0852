//! # Storage Types
//!
//! Records kept next to every stored object.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fetcher::add_duration;

/// Metadata persisted alongside a stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMetadata {
    /// Cache key the object was stored under
    pub key: String,
    /// URL the bytes were fetched from
    pub url: String,
    /// Last time the origin confirmed these bytes
    pub stored_at: DateTime<Utc>,
    /// Until when the bytes may be served without asking the origin
    pub valid_till: DateTime<Utc>,
    /// Last read or write, drives LRU eviction
    pub touched_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub file_extension: String,
    pub size: u64,
}

impl StoredMetadata {
    pub fn new(key: impl Into<String>, url: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            url: url.into(),
            stored_at: now,
            valid_till: now,
            touched_at: now,
            etag: None,
            last_modified: None,
            file_extension: String::new(),
            size,
        }
    }

    pub fn with_valid_till(mut self, valid_till: DateTime<Utc>) -> Self {
        self.valid_till = valid_till;
        self
    }

    pub fn with_etag_option(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified_option(mut self, last_modified: Option<String>) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Classify the entry at `now` for a bucket whose entries go stale after
    /// `stale_after`.
    pub fn freshness(&self, now: DateTime<Utc>, stale_after: Duration) -> Freshness {
        if now < self.valid_till {
            Freshness::Fresh
        } else if now < add_duration(self.stored_at, stale_after) {
            Freshness::NeedsRevalidation
        } else {
            Freshness::Stale
        }
    }

    /// Whether the origin can be asked with a conditional request.
    pub fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Lifecycle position of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve from storage
    Fresh,
    /// Ask the origin whether the stored bytes are still current
    NeedsRevalidation,
    /// Too old to revalidate, fetch from scratch
    Stale,
}

/// Where the bytes handed to the caller came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSource {
    /// Fresh entry, no network traffic
    Storage,
    /// Origin answered 304 for the stored entry
    Revalidated,
    /// Revalidation failed, stored bytes served anyway
    StaleIfError,
    /// Downloaded in full
    Network,
}

/// Bytes returned from a bucket
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub bytes: Bytes,
    pub metadata: StoredMetadata,
    pub source: ObjectSource,
}

/// Result of a storage operation
pub type StoreResult<T> = std::result::Result<T, std::io::Error>;

/// Result of a storage lookup
pub type StoreLookup = StoreResult<Option<(Bytes, StoredMetadata)>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_windows() {
        let stored = Utc::now();
        let mut meta = StoredMetadata::new("k", "https://x/a.png", 3)
            .with_valid_till(add_duration(stored, Duration::from_secs(60)));
        meta.stored_at = stored;
        let stale_after = Duration::from_secs(3600);

        assert_eq!(meta.freshness(stored, stale_after), Freshness::Fresh);
        assert_eq!(
            meta.freshness(add_duration(stored, Duration::from_secs(61)), stale_after),
            Freshness::NeedsRevalidation
        );
        assert_eq!(
            meta.freshness(add_duration(stored, Duration::from_secs(3601)), stale_after),
            Freshness::Stale
        );
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let meta = StoredMetadata::new("u:1|https://x/a.png", "https://x/a.png", 42)
            .with_etag_option(Some("\"e\"".into()))
            .with_file_extension(".png");
        let json = serde_json::to_string(&meta).unwrap();
        let back: StoredMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert!(back.has_validator());
    }
}
