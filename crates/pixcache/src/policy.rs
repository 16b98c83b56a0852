//! # Bucket Policies
//!
//! Every cached image belongs to a bucket. A bucket fixes how long its
//! content stays fresh, how many objects are retained, where it lives on
//! disk and how aggressively it may hit the network.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Category of cached content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Bucket {
    Avatar,
    Icon,
    Thumbnail,
    Content,
    Banner,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Avatar,
        Bucket::Icon,
        Bucket::Thumbnail,
        Bucket::Content,
        Bucket::Banner,
    ];

    /// Buckets expected to hold user-identifiable content.
    pub const USER_SCOPED: [Bucket; 2] = [Bucket::Avatar, Bucket::Content];

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Avatar => "avatar",
            Bucket::Icon => "icon",
            Bucket::Thumbnail => "thumbnail",
            Bucket::Content => "content",
            Bucket::Banner => "banner",
        }
    }

    /// Long-lived buckets are stored under the persistent root, the rest
    /// under the temporary root.
    pub fn is_long_lived(self) -> bool {
        matches!(self, Bucket::Avatar | Bucket::Icon)
    }

    pub fn default_policy(self) -> BucketPolicy {
        match self {
            Bucket::Avatar => BucketPolicy {
                versioned_key: "avatar-v1".to_string(),
                stale_after: Duration::from_secs(7 * DAY),
                max_objects: 500,
                min_fresh: Duration::from_secs(HOUR),
                max_fresh: Duration::from_secs(DAY),
                max_concurrent_fetches: 4,
                response_timeout: Duration::from_secs(10),
                stream_timeout: Duration::from_secs(15),
                max_retry_attempts: 3,
            },
            Bucket::Icon => BucketPolicy {
                versioned_key: "icon-v1".to_string(),
                stale_after: Duration::from_secs(30 * DAY),
                max_objects: 300,
                min_fresh: Duration::from_secs(6 * HOUR),
                max_fresh: Duration::from_secs(7 * DAY),
                max_concurrent_fetches: 4,
                response_timeout: Duration::from_secs(8),
                stream_timeout: Duration::from_secs(10),
                max_retry_attempts: 3,
            },
            Bucket::Thumbnail => BucketPolicy {
                versioned_key: "thumbnail-v1".to_string(),
                stale_after: Duration::from_secs(3 * DAY),
                max_objects: 1000,
                min_fresh: Duration::from_secs(30 * MINUTE),
                max_fresh: Duration::from_secs(12 * HOUR),
                max_concurrent_fetches: 6,
                response_timeout: Duration::from_secs(10),
                stream_timeout: Duration::from_secs(15),
                max_retry_attempts: 3,
            },
            Bucket::Content => BucketPolicy {
                versioned_key: "content-v1".to_string(),
                stale_after: Duration::from_secs(7 * DAY),
                max_objects: 400,
                min_fresh: Duration::from_secs(HOUR),
                max_fresh: Duration::from_secs(2 * DAY),
                max_concurrent_fetches: 3,
                response_timeout: Duration::from_secs(15),
                stream_timeout: Duration::from_secs(20),
                max_retry_attempts: 4,
            },
            Bucket::Banner => BucketPolicy {
                versioned_key: "banner-v1".to_string(),
                stale_after: Duration::from_secs(3 * DAY),
                max_objects: 50,
                min_fresh: Duration::from_secs(HOUR),
                max_fresh: Duration::from_secs(DAY),
                max_concurrent_fetches: 2,
                response_timeout: Duration::from_secs(15),
                stream_timeout: Duration::from_secs(20),
                max_retry_attempts: 3,
            },
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Bucket {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown bucket '{s}'")))
    }
}

/// Retention, freshness and concurrency parameters of a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Storage directory name, `<name>-v<N>`
    pub versioned_key: String,
    /// Entries older than this are refetched instead of revalidated
    pub stale_after: Duration,
    /// Maximum number of retained objects
    pub max_objects: usize,
    /// Lower clamp for response freshness
    pub min_fresh: Duration,
    /// Upper clamp for response freshness
    pub max_fresh: Duration,
    /// Simultaneous downloads allowed for this bucket
    pub max_concurrent_fetches: usize,
    /// Base timeout for a single attempt
    pub response_timeout: Duration,
    /// Maximum silence on a response body
    pub stream_timeout: Duration,
    pub max_retry_attempts: u32,
}

impl BucketPolicy {
    /// Name prefix shared by every version of this policy's directory,
    /// e.g. `avatar-v` for `avatar-v3`.
    pub fn generation_prefix(&self) -> Option<&str> {
        split_versioned_key(&self.versioned_key).map(|(name, _)| &self.versioned_key[..name.len() + 2])
    }

    pub fn validate(&self, bucket: Bucket) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPolicy {
            bucket: bucket.to_string(),
            reason,
        };

        if split_versioned_key(&self.versioned_key).is_none() {
            return Err(invalid(format!(
                "versioned key '{}' does not match <name>-v<N>",
                self.versioned_key
            )));
        }
        if self.min_fresh >= self.max_fresh {
            return Err(invalid(format!(
                "min_fresh {:?} must be below max_fresh {:?}",
                self.min_fresh, self.max_fresh
            )));
        }
        if self.max_fresh >= self.stale_after {
            return Err(invalid(format!(
                "max_fresh {:?} must be below stale_after {:?}",
                self.max_fresh, self.stale_after
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(invalid("max_concurrent_fetches must be positive".into()));
        }
        if self.max_objects == 0 {
            return Err(invalid("max_objects must be positive".into()));
        }
        if self.max_retry_attempts == 0 {
            return Err(invalid("max_retry_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Split `<name>-v<N>` into its name and version parts.
pub(crate) fn split_versioned_key(key: &str) -> Option<(&str, &str)> {
    let (name, version) = key.rsplit_once("-v")?;
    if name.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((name, version))
}
