/// State management module
///
/// This module handles all persisted scan state:
/// - Shared data structures (data.rs)
/// - Durable key-value storage backends (store.rs)
/// - The (asset, threshold) result cache (cache.rs)

pub mod cache;
pub mod data;
pub mod store;

pub use cache::ResultCache;
pub use data::{AssetId, CacheEntry, CacheKey, ProgressEvent};
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StoreError};
