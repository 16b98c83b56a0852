use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::ConfigError;
use crate::policy::{Bucket, BucketPolicy};

pub(crate) const DEFAULT_USER_AGENT: &str = "pixcache/0.1 (+https://github.com/hua0512/rust-srec)";

/// Extensions that, on a 200 response, mean a portal page answered instead
/// of the image.
pub(crate) const DEFAULT_CAPTIVE_PORTAL_EXTENSIONS: &[&str] = &[".html", ".json", ".txt", ".xml"];

/// Circuit breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a host circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit rejects requests before admitting a probe
    pub reset_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_duration: Duration::from_secs(30),
        }
    }
}

/// Where bucket objects are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// One directory per bucket under the bucket's root
    #[default]
    File,
    /// Process memory only, nothing survives a restart
    Memory,
}

/// Configurable options for the cache registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root for long-lived buckets (avatar, icon)
    pub persistent_root: PathBuf,

    /// Root for evictable buckets
    pub temporary_root: PathBuf,

    /// Maximum in-flight fetches across every bucket
    pub global_concurrency: usize,

    /// Per-host circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// User agent injected when a request does not carry one
    pub user_agent: String,

    /// Custom HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Response extensions treated as captive portal pages on a 200
    pub captive_portal_extensions: Vec<String>,

    /// Whether response bodies are sniffed for HTML/JSON signatures
    pub sniff_content: bool,

    /// Connection timeout of the HTTP client
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// Replacement policies keyed by bucket
    pub policy_overrides: HashMap<Bucket, BucketPolicy>,

    pub storage_backend: StorageBackend,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("pixcache");
        Self {
            persistent_root: base.join("data"),
            temporary_root: base.join("cache"),
            global_concurrency: 6,
            circuit_breaker: CircuitBreakerConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: RegistryConfig::get_default_headers(),
            captive_portal_extensions: DEFAULT_CAPTIVE_PORTAL_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sniff_content: true,
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            policy_overrides: HashMap::new(),
            storage_backend: StorageBackend::File,
        }
    }
}

impl RegistryConfig {
    pub fn builder() -> crate::builder::RegistryConfigBuilder {
        crate::builder::RegistryConfigBuilder::new()
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/apng,image/*,*/*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }

    /// Effective policy for a bucket, honoring overrides.
    pub fn policy(&self, bucket: Bucket) -> BucketPolicy {
        self.policy_overrides
            .get(&bucket)
            .cloned()
            .unwrap_or_else(|| bucket.default_policy())
    }

    /// Root directory a bucket is stored under.
    pub fn root_for(&self, bucket: Bucket) -> &PathBuf {
        if bucket.is_long_lived() {
            &self.persistent_root
        } else {
            &self.temporary_root
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "global_concurrency must be positive".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker failure_threshold must be positive".into(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty".into()));
        }
        for bucket in Bucket::ALL {
            self.policy(bucket).validate(bucket)?;
        }
        Ok(())
    }
}
