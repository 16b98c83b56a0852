//! # Bucket Storage
//!
//! Object stores backing the buckets and the per-bucket manager that
//! decides between serving stored bytes, revalidating them and downloading
//! them again.

mod file;
mod manager;
mod memory;
mod provider;
mod types;

pub use file::FileStore;
pub use manager::StorageManager;
pub use memory::MemoryStore;
pub use provider::ObjectStore;
pub use types::{
    CachedObject, Freshness, ObjectSource, StoreLookup, StoreResult, StoredMetadata,
};
