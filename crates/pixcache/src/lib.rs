//! # Pixcache
//!
//! A resilient image fetch and cache policy engine for unreliable networks.
//!
//! ## Features
//!
//! - Deterministic cache keys with volatile query parameters stripped and
//!   optional per-user scoping
//! - Per-host circuit breaking with a single half-open probe
//! - Retries with adaptive timeouts, connectivity probes and jittered backoff
//! - Captive portal detection on headers and body signatures
//! - Stale-if-error answers for failed revalidations
//! - Per-bucket retention, freshness and concurrency policies with
//!   versioned storage directories

pub mod builder;
pub mod circuit;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod key;
pub mod policy;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod test_utils;

pub use builder::RegistryConfigBuilder;
pub use circuit::{Admission, HostCircuitBreaker, HostCircuitState, ProbeClaim};
pub use config::{CircuitBreakerConfig, RegistryConfig, StorageBackend};
pub use error::{ConfigError, FetchError, RegistryError};
pub use events::{MetricEvent, MetricKind, MetricsHub, MetricsSink, TracingSink};
pub use fetcher::{
    ConnectivityProbe, DnsProbe, FetchContext, FetchResponse, HttpTransport, ReqwestTransport,
    ResilientFetcher, ResponseMeta,
};
pub use key::KeyBuilder;
pub use policy::{Bucket, BucketPolicy};
pub use registry::CacheRegistry;
pub use storage::{CachedObject, FileStore, MemoryStore, ObjectSource, ObjectStore, StorageManager};
