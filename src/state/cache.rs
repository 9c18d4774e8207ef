/// Persisted (asset, threshold) -> decision cache
///
/// Loaded once per scan from a `KeyValueStore`, mutated in memory by the
/// scoring tasks, and written back once when the scan ends. A cache is an
/// optimization: anything unreadable on load is treated as an empty cache.

use super::data::{AssetId, CacheEntry, CacheKey};
use super::store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bump when the persisted record layout changes
const FORMAT_VERSION: u32 = 1;

/// Default storage key of the cache blob
pub const DEFAULT_CACHE_KEY: &str = "blur_scan.results";

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<CacheEntry>,
}

pub struct ResultCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    // A panic while holding the map cannot leave an entry half written,
    // so a poisoned lock is still safe to use.
    fn map(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the in-memory map with the persisted contents
    ///
    /// Returns the number of entries loaded. Read failures, undecodable blobs
    /// and unknown format versions all load as an empty cache.
    pub fn load_all(&self) -> usize {
        let loaded = match self.store.read_blob(&self.key) {
            Ok(Some(bytes)) => decode(&bytes),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "result cache unreadable, starting cold");
                HashMap::new()
            }
        };

        let count = loaded.len();
        *self.map() = loaded;
        tracing::debug!(entries = count, "result cache loaded");
        count
    }

    /// Write the whole map back to the store
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let mut entries: Vec<CacheEntry> = self.map().values().cloned().collect();
        // Stable output makes the blob diffable
        entries.sort_by(|a, b| {
            a.asset_id
                .cmp(&b.asset_id)
                .then(a.threshold.total_cmp(&b.threshold))
        });

        let count = entries.len();
        let persisted = PersistedCache {
            version: FORMAT_VERSION,
            entries,
        };
        // Serializing plain records cannot fail; an empty blob would reload as empty anyway
        let bytes = serde_json::to_vec(&persisted).unwrap_or_default();
        self.store.write_blob(&self.key, &bytes)?;
        tracing::debug!(entries = count, "result cache flushed");
        Ok(())
    }

    /// Pure in-memory read
    pub fn lookup(&self, asset_id: &AssetId, threshold: f64) -> Option<CacheEntry> {
        let key = CacheKey::new(asset_id.clone(), threshold);
        self.map().get(&key).cloned()
    }

    /// Insert or overwrite the entry for the entry's (asset, threshold)
    pub fn store(&self, entry: CacheEntry) {
        self.map().insert(entry.key(), entry);
    }

    /// Drop every entry; persisted on the next flush
    pub fn clear(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("key", &self.key)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn decode(bytes: &[u8]) -> HashMap<CacheKey, CacheEntry> {
    match serde_json::from_slice::<PersistedCache>(bytes) {
        Ok(persisted) if persisted.version == FORMAT_VERSION => persisted
            .entries
            .into_iter()
            .filter(|e| e.threshold.is_finite() && e.score.is_finite())
            .map(|e| (e.key(), e))
            .collect(),
        Ok(persisted) => {
            tracing::warn!(
                found = persisted.version,
                expected = FORMAT_VERSION,
                "result cache format changed, starting cold"
            );
            HashMap::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "result cache corrupt, starting cold");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::MemoryStore;

    fn cache_with_store() -> (Arc<MemoryStore>, ResultCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(store.clone(), DEFAULT_CACHE_KEY);
        (store, cache)
    }

    #[test]
    fn test_store_does_not_leak_across_thresholds() {
        let (_, cache) = cache_with_store();
        let asset = AssetId::from("IMG_0001");

        cache.store(CacheEntry::classify(asset.clone(), 0.01, 0.005));
        assert!(cache.lookup(&asset, 0.01).unwrap().is_blurry);
        assert!(cache.lookup(&asset, 0.02).is_none());

        cache.store(CacheEntry::classify(asset.clone(), 0.002, 0.005));
        assert!(!cache.lookup(&asset, 0.002).unwrap().is_blurry);
        // The first entry is untouched
        assert!(cache.lookup(&asset, 0.01).unwrap().is_blurry);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_store_overwrites_same_key() {
        let (_, cache) = cache_with_store();
        let asset = AssetId::from("IMG_0002");

        cache.store(CacheEntry::classify(asset.clone(), 0.01, 0.5));
        cache.store(CacheEntry::classify(asset.clone(), 0.01, 0.001));

        let entry = cache.lookup(&asset, 0.01).unwrap();
        assert!(entry.is_blurry);
        assert_eq!(entry.score, 0.001);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_then_load_round_trip() {
        let (store, cache) = cache_with_store();
        let entry = CacheEntry::classify("IMG_0003".into(), 0.01, 0.25);
        cache.store(entry.clone());
        cache.flush_all().unwrap();

        let fresh = ResultCache::new(store, DEFAULT_CACHE_KEY);
        assert_eq!(fresh.load_all(), 1);
        assert_eq!(fresh.lookup(&entry.asset_id, 0.01), Some(entry));
    }

    #[test]
    fn test_corrupt_blob_loads_empty() {
        let (store, cache) = cache_with_store();
        store.write_blob(DEFAULT_CACHE_KEY, b"{not json").unwrap();
        assert_eq!(cache.load_all(), 0);

        store
            .write_blob(DEFAULT_CACHE_KEY, br#"{"version":99,"entries":[]}"#)
            .unwrap();
        assert_eq!(cache.load_all(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_replaces_memory_state() {
        let (_, cache) = cache_with_store();
        cache.store(CacheEntry::classify("stale".into(), 0.01, 0.0));
        // Nothing persisted yet, so a reload empties the map
        assert_eq!(cache.load_all(), 0);
        assert!(cache.lookup(&"stale".into(), 0.01).is_none());
    }

    #[test]
    fn test_clear_persists_on_flush() {
        let (store, cache) = cache_with_store();
        cache.store(CacheEntry::classify("a".into(), 0.01, 0.0));
        cache.flush_all().unwrap();

        cache.clear();
        cache.flush_all().unwrap();

        let fresh = ResultCache::new(store, DEFAULT_CACHE_KEY);
        assert_eq!(fresh.load_all(), 0);
    }

    #[test]
    fn test_concurrent_writers() {
        let (_, cache) = cache_with_store();
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = AssetId::new(format!("asset-{t}-{i}"));
                        cache.store(CacheEntry::classify(id, 0.01, i as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
    }
}
