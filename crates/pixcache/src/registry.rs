//! # Cache Registry
//!
//! Entry point of the engine. The registry owns the process-wide fetch
//! context (global pool, host circuit breaker, metrics hub), the session's
//! user identity and one lazily built [`StorageManager`] per bucket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::circuit::HostCircuitBreaker;
use crate::config::{RegistryConfig, StorageBackend};
use crate::error::RegistryError;
use crate::events::MetricsSink;
use crate::fetcher::{
    ConnectivityProbe, DnsProbe, FetchContext, HttpTransport, ReqwestTransport, ResilientFetcher,
};
use crate::key::KeyBuilder;
use crate::policy::{Bucket, BucketPolicy};
use crate::storage::{CachedObject, FileStore, MemoryStore, ObjectStore, StorageManager};

#[derive(Debug, Default)]
struct Session {
    user_id: Option<String>,
    initialized: bool,
}

pub struct CacheRegistry {
    config: RegistryConfig,
    ctx: FetchContext,
    session: RwLock<Session>,
    managers: Mutex<HashMap<Bucket, Arc<StorageManager>>>,
    swept: AtomicBool,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("session", &*self.session.read())
            .field("managers", &self.managers.lock().len())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl CacheRegistry {
    /// Registry talking to the network through reqwest, probing with DNS.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::build(config, transport, Arc::new(DnsProbe::default())))
    }

    /// Registry with injected network collaborators.
    pub fn with_transport(
        config: RegistryConfig,
        transport: Arc<dyn HttpTransport>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        Ok(Self::build(config, transport, probe))
    }

    fn build(
        config: RegistryConfig,
        transport: Arc<dyn HttpTransport>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let ctx = FetchContext::new(&config, transport, probe);
        Self {
            config,
            ctx,
            session: RwLock::new(Session::default()),
            managers: Mutex::new(HashMap::new()),
            swept: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<HostCircuitBreaker> {
        self.ctx.breaker()
    }

    /// Set the session user and metrics sink, then delete storage
    /// directories left behind by older policy versions.
    ///
    /// The sweep runs once per registry; later calls only update the session.
    pub async fn initialize(&self, user_id: Option<String>, sink: Option<Arc<dyn MetricsSink>>) {
        {
            let mut session = self.session.write();
            session.user_id = user_id;
            session.initialized = true;
        }
        if sink.is_some() {
            self.ctx.metrics().set_sink(sink);
        }

        if self.swept.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.sweep_obsolete_generations().await;
        info!(removed, "Cache registry initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.session.read().initialized
    }

    /// Delete `<name>-v*` directories under both storage roots that are not
    /// the configured generation. Best effort; returns the number of
    /// directories removed.
    pub async fn sweep_obsolete_generations(&self) -> usize {
        let current: Vec<BucketPolicy> = Bucket::ALL
            .iter()
            .map(|b| self.config.policy(*b))
            .collect();

        let mut roots = vec![self.config.persistent_root.as_path()];
        if self.config.temporary_root != self.config.persistent_root {
            roots.push(self.config.temporary_root.as_path());
        }

        let mut removed = 0;
        for root in roots {
            removed += sweep_root(root, &current).await;
        }
        removed
    }

    /// Storage manager of `bucket`, built on first use.
    pub fn get_manager(&self, bucket: Bucket) -> Arc<StorageManager> {
        let mut managers = self.managers.lock();
        managers
            .entry(bucket)
            .or_insert_with(|| {
                let policy = self.config.policy(bucket);
                let store: Arc<dyn ObjectStore> = match self.config.storage_backend {
                    StorageBackend::File => Arc::new(FileStore::new(
                        self.config.root_for(bucket).join(&policy.versioned_key),
                    )),
                    StorageBackend::Memory => Arc::new(MemoryStore::new(policy.max_objects as u64)),
                };
                debug!(bucket = %bucket, versioned_key = %policy.versioned_key, "Creating storage manager");
                let fetcher = ResilientFetcher::new(self.ctx.clone(), policy);
                Arc::new(StorageManager::new(bucket, store, fetcher))
            })
            .clone()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.session.write().user_id = user_id;
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.session.read().user_id.clone()
    }

    /// Cache key for `url` under the current session user.
    pub fn build_cache_key(&self, url: &str, explicit_key: Option<&str>, is_private: bool) -> String {
        let session = self.session.read();
        KeyBuilder::build(url, explicit_key, session.user_id.as_deref(), is_private)
    }

    /// Bytes of `url` from `bucket`, fetched and stored when needed.
    pub async fn get(
        &self,
        bucket: Bucket,
        url: &str,
        explicit_key: Option<&str>,
        is_private: bool,
        headers: Option<&HeaderMap>,
    ) -> Result<CachedObject, RegistryError> {
        let key = self.build_cache_key(url, explicit_key, is_private);
        self.get_manager(bucket).get_bytes(url, &key, headers).await
    }

    pub async fn clear(&self, bucket: Bucket) -> Result<(), RegistryError> {
        self.get_manager(bucket).clear().await
    }

    /// Empty every bucket and forget all host failures.
    pub async fn clear_all(&self) -> Result<(), RegistryError> {
        let mut first_error = None;
        for bucket in Bucket::ALL {
            if let Err(e) = self.clear(bucket).await {
                warn!(bucket = %bucket, error = %e, "Failed to clear bucket");
                first_error.get_or_insert(e);
            }
        }
        self.reset_circuit_breakers();
        first_error.map_or(Ok(()), Err)
    }

    /// Empty the buckets holding user-identifiable content.
    pub async fn clear_user_caches(&self) -> Result<(), RegistryError> {
        for bucket in Bucket::USER_SCOPED {
            self.clear(bucket).await?;
        }
        info!("User caches cleared");
        Ok(())
    }

    pub fn reset_circuit_breakers(&self) {
        self.ctx.breaker().reset_all();
    }
}

async fn sweep_root(root: &Path, current: &[BucketPolicy]) -> usize {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = ?root, error = %e, "Skipping sweep of unreadable root");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(root = ?root, error = %e, "Sweep interrupted");
                break;
            }
        };
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_obsolete_generation(name, current) {
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(dir = ?entry.path(), "Removed obsolete storage generation");
                    removed += 1;
                }
                Err(e) => warn!(dir = ?entry.path(), error = %e, "Failed to remove obsolete storage generation"),
            }
        }
    }
    removed
}

/// A directory is obsolete when it carries a configured policy's
/// `<name>-v` prefix without being that policy's current directory.
fn is_obsolete_generation(dir_name: &str, current: &[BucketPolicy]) -> bool {
    let shares_prefix = current.iter().any(|policy| {
        policy
            .generation_prefix()
            .is_some_and(|prefix| dir_name.starts_with(prefix))
    });
    shares_prefix && !current.iter().any(|policy| policy.versioned_key == dir_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::events::MetricKind;
    use crate::storage::ObjectSource;
    use crate::test_utils::{CollectingSink, PNG_BYTES, Scripted, ScriptedTransport, StaticProbe};
    use bytes::Bytes;

    fn registry_in(dir: &Path, transport: Arc<ScriptedTransport>) -> CacheRegistry {
        let config = RegistryConfig::builder()
            .with_persistent_root(dir.join("data"))
            .with_temporary_root(dir.join("cache"))
            .build();
        CacheRegistry::with_transport(config, transport, StaticProbe::online()).unwrap()
    }

    fn memory_registry(transport: Arc<ScriptedTransport>) -> CacheRegistry {
        let config = RegistryConfig::builder()
            .with_storage_backend(StorageBackend::Memory)
            .build();
        CacheRegistry::with_transport(config, transport, StaticProbe::online()).unwrap()
    }

    #[test]
    fn test_obsolete_generation_detection() {
        let mut avatar = Bucket::Avatar.default_policy();
        avatar.versioned_key = "avatar-v2".to_string();
        let current = vec![avatar, Bucket::Thumbnail.default_policy()];
        assert!(is_obsolete_generation("avatar-v1", &current));
        assert!(is_obsolete_generation("avatar-vbeta", &current));
        assert!(is_obsolete_generation("thumbnail-v1-old", &current));
        assert!(!is_obsolete_generation("avatar-v2", &current));
        assert!(!is_obsolete_generation("unrelated-v1", &current));
        assert!(!is_obsolete_generation("avatar", &current));
        assert!(!is_obsolete_generation("thumbnail-v1", &current));
    }

    #[tokio::test]
    async fn test_initialize_sweeps_old_generations_once() {
        let dir = tempfile::tempdir().unwrap();
        for path in [
            "data/avatar-v0",
            "data/avatar-v1",
            "cache/thumbnail-v0",
            "cache/thumbnail-v1",
            "cache/thumbnail-vbeta",
            "cache/other-v3",
        ] {
            std::fs::create_dir_all(dir.path().join(path)).unwrap();
        }
        std::fs::write(dir.path().join("cache/thumbnail-v0/blob"), b"old").unwrap();

        let registry = registry_in(dir.path(), ScriptedTransport::new([]));
        assert!(!registry.is_initialized());
        registry.initialize(Some("u1".into()), None).await;

        assert!(registry.is_initialized());
        assert_eq!(registry.current_user_id().as_deref(), Some("u1"));
        assert!(!dir.path().join("data/avatar-v0").exists());
        assert!(!dir.path().join("cache/thumbnail-v0").exists());
        assert!(!dir.path().join("cache/thumbnail-vbeta").exists());
        assert!(dir.path().join("data/avatar-v1").exists());
        assert!(dir.path().join("cache/thumbnail-v1").exists());
        assert!(dir.path().join("cache/other-v3").exists());

        std::fs::create_dir_all(dir.path().join("cache/banner-v0")).unwrap();
        registry.initialize(None, None).await;
        assert!(dir.path().join("cache/banner-v0").exists());
        assert_eq!(registry.current_user_id(), None);
    }

    #[tokio::test]
    async fn test_initialize_tolerates_missing_roots() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir.path().join("nowhere"), ScriptedTransport::new([]));
        registry.initialize(None, None).await;
        assert_eq!(registry.sweep_obsolete_generations().await, 0);
    }

    #[test]
    fn test_managers_are_memoized() {
        let registry = memory_registry(ScriptedTransport::new([]));
        let a = registry.get_manager(Bucket::Banner);
        let b = registry.get_manager(Bucket::Banner);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.policy().max_concurrent_fetches, 2);
        assert!(!Arc::ptr_eq(&a, &registry.get_manager(Bucket::Thumbnail)));
    }

    #[test]
    fn test_cache_keys_follow_session_user() {
        let registry = memory_registry(ScriptedTransport::new([]));
        let url = "https://x/y.jpg?token=abc&w=1";

        assert_eq!(registry.build_cache_key(url, None, true), "https://x/y.jpg?w=1");
        registry.set_user_id(Some("u1".into()));
        assert_eq!(
            registry.build_cache_key(url, None, true),
            "u:u1|https://x/y.jpg?w=1"
        );
        assert_eq!(registry.build_cache_key(url, None, false), "https://x/y.jpg?w=1");
        assert_eq!(registry.build_cache_key(url, Some("fixed"), true), "fixed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_fetches_once_per_key() {
        let transport = ScriptedTransport::new([Scripted::png()]);
        let registry = memory_registry(transport.clone());
        let url = "https://img.example.com/a.png?token=1";

        let first = registry.get(Bucket::Icon, url, None, false, None).await.unwrap();
        assert_eq!(first.source, ObjectSource::Network);
        assert_eq!(first.bytes, Bytes::from_static(PNG_BYTES));
        assert_eq!(first.metadata.key, "https://img.example.com/a.png");

        let second = registry
            .get(Bucket::Icon, "https://img.example.com/a.png?token=2", None, false, None)
            .await
            .unwrap();
        assert_eq!(second.source, ObjectSource::Storage);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_entries_scoped_per_user() {
        let transport = ScriptedTransport::new([Scripted::png(), Scripted::png()]);
        let registry = memory_registry(transport.clone());
        let url = "https://img.example.com/me.png";

        registry.set_user_id(Some("alice".into()));
        registry.get(Bucket::Avatar, url, None, true, None).await.unwrap();
        registry.set_user_id(Some("bob".into()));
        let object = registry.get(Bucket::Avatar, url, None, true, None).await.unwrap();

        assert_eq!(object.source, ObjectSource::Network);
        assert_eq!(object.metadata.key, "u:bob|https://img.example.com/me.png");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_backed_get_lands_in_bucket_directory() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new([Scripted::png()]);
        let registry = registry_in(dir.path(), transport);

        registry
            .get(Bucket::Avatar, "https://img.example.com/a.png", None, false, None)
            .await
            .unwrap();
        let bucket_dir = dir.path().join("data/avatar-v1");
        assert_eq!(std::fs::read_dir(&bucket_dir).unwrap().count(), 2);

        registry.clear(Bucket::Avatar).await.unwrap();
        assert_eq!(std::fs::read_dir(&bucket_dir).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_user_caches_only_touches_user_buckets() {
        let transport = ScriptedTransport::repeat(Scripted::png(), 6);
        let registry = memory_registry(transport.clone());
        let url = "https://img.example.com/x.png";

        for bucket in [Bucket::Avatar, Bucket::Content, Bucket::Icon] {
            registry.get(bucket, url, None, false, None).await.unwrap();
        }
        registry.clear_user_caches().await.unwrap();

        for (bucket, expected) in [
            (Bucket::Avatar, 0),
            (Bucket::Content, 0),
            (Bucket::Icon, 1),
        ] {
            let len = registry.get_manager(bucket).store().len().await.unwrap();
            assert_eq!(len, expected, "{bucket}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_resets_circuits() {
        let transport = ScriptedTransport::new([Scripted::png()]);
        let registry = memory_registry(transport.clone());
        for _ in 0..registry.breaker().failure_threshold() {
            registry.breaker().record_failure("img.example.com");
        }

        let err = registry
            .get(Bucket::Banner, "https://img.example.com/b.png", None, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Fetch(FetchError::CircuitOpen(_))));

        registry.clear_all().await.unwrap();
        assert!(!registry.breaker().is_open("img.example.com"));
        registry
            .get(Bucket::Banner, "https://img.example.com/b.png", None, false, None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_installed_after_managers_receives_events() {
        let transport = ScriptedTransport::new([Scripted::png()]);
        let registry = memory_registry(transport);
        let manager = registry.get_manager(Bucket::Thumbnail);

        let sink = Arc::new(CollectingSink::default());
        registry.initialize(None, Some(sink.clone())).await;
        manager
            .get_bytes("https://img.example.com/t.png", "t", None)
            .await
            .unwrap();

        assert_eq!(sink.count(MetricKind::FetchStarted), 1);
        assert_eq!(sink.count(MetricKind::FetchSucceeded), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RegistryConfig::builder().with_global_concurrency(0).build();
        let result =
            CacheRegistry::with_transport(config, ScriptedTransport::new([]), StaticProbe::online());
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }
}
