//! # Builder for RegistryConfig
//!
//! Fluent construction of [`RegistryConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pixcache_engine::{Bucket, RegistryConfig};
//!
//! let mut banner = Bucket::Banner.default_policy();
//! banner.max_concurrent_fetches = 1;
//!
//! let config = RegistryConfig::builder()
//!     .with_persistent_root("/var/lib/app/images")
//!     .with_temporary_root("/var/cache/app/images")
//!     .with_global_concurrency(4)
//!     .with_circuit_reset_duration(Duration::from_secs(10))
//!     .with_policy(Bucket::Banner, banner)
//!     .with_header("X-Client", "demo")
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::{RegistryConfig, StorageBackend};
use crate::policy::{Bucket, BucketPolicy};

/// Builder for creating RegistryConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RegistryConfig::default(),
        }
    }

    pub fn with_persistent_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.persistent_root = root.into();
        self
    }

    pub fn with_temporary_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.temporary_root = root.into();
        self
    }

    /// Set the capacity of the global fetch pool
    pub fn with_global_concurrency(mut self, permits: usize) -> Self {
        self.config.global_concurrency = permits;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn with_circuit_reset_duration(mut self, duration: Duration) -> Self {
        self.config.circuit_breaker.reset_duration = duration;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Replace the captive portal extension list, e.g. to allow JSON payloads
    pub fn with_captive_portal_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.captive_portal_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_sniffing(mut self, enabled: bool) -> Self {
        self.config.sniff_content = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Override the policy of one bucket
    pub fn with_policy(mut self, bucket: Bucket, policy: BucketPolicy) -> Self {
        self.config.policy_overrides.insert(bucket, policy);
        self
    }

    pub fn with_storage_backend(mut self, backend: StorageBackend) -> Self {
        self.config.storage_backend = backend;
        self
    }

    pub fn build(self) -> RegistryConfig {
        self.config
    }
}

impl Default for RegistryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
