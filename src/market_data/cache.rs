//! TTL cache over a pluggable store.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: DateTime<Utc>,
}

/// Backing storage for [`ExpiringCache`].
pub trait CacheStore<V>: Send + Sync {
    fn load(&self, key: &str) -> Option<CacheEntry<V>>;
    fn store(&self, key: &str, entry: CacheEntry<V>);
    fn remove(&self, key: &str);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-local store.
pub struct MemoryStore<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> CacheStore<V> for MemoryStore<V> {
    fn load(&self, key: &str) -> Option<CacheEntry<V>> {
        lock(&self.entries).get(key).cloned()
    }

    fn store(&self, key: &str, entry: CacheEntry<V>) {
        lock(&self.entries).insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}

/// JSON file store that survives restarts.
///
/// The whole map is rewritten on each change via a temp file and rename, so a
/// crash never leaves a torn file behind.
pub struct FileStore<V> {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Serialize + DeserializeOwned + Clone + Send> FileStore<V> {
    /// Open the store, starting empty if the file is absent or unreadable.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Discarding unreadable cache file {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        debug!("Opened cache file {} ({} entries)", path.display(), entries.len());
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn flush(&self, entries: &HashMap<String, CacheEntry<V>>) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let json = serde_json::to_vec(entries).map_err(std::io::Error::other)?;
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = result {
            warn!("Failed to write cache file {}: {}", self.path.display(), e);
        }
    }
}

impl<V: Serialize + DeserializeOwned + Clone + Send> CacheStore<V> for FileStore<V> {
    fn load(&self, key: &str) -> Option<CacheEntry<V>> {
        lock(&self.entries).get(key).cloned()
    }

    fn store(&self, key: &str, entry: CacheEntry<V>) {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), entry);
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.flush(&entries);
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Cache that serves a value only until its TTL lapses.
pub struct ExpiringCache<V> {
    store: Box<dyn CacheStore<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new(store: Box<dyn CacheStore<V>>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key` at `now`; expired entries are evicted.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        match self.store.load(key) {
            Some(entry) if now < entry.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            Some(_) => {
                self.store.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: V, now: DateTime<Utc>) {
        if self.ttl <= Duration::zero() {
            return;
        }
        self.store.store(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = ExpiringCache::new(Box::new(MemoryStore::new()), Duration::seconds(60));
        let t0 = Utc::now();

        cache.insert("AAPL", 42u32, t0);
        assert_eq!(cache.get("AAPL", t0 + Duration::seconds(59)), Some(42));
        assert_eq!(cache.get("AAPL", t0 + Duration::seconds(60)), None);
        // evicted, so a later read is still a miss
        assert_eq!(cache.get("AAPL", t0), None);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 2 });
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = ExpiringCache::new(Box::new(MemoryStore::new()), Duration::zero());
        let now = Utc::now();
        cache.insert("AAPL", 1u32, now);
        assert_eq!(cache.get("AAPL", now), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("alt.json");
        let now = Utc::now();

        {
            let cache: ExpiringCache<String> =
                ExpiringCache::new(Box::new(FileStore::open(&path)), Duration::minutes(10));
            cache.insert("NVDA", "cached".to_string(), now);
        }

        let reopened: ExpiringCache<String> =
            ExpiringCache::new(Box::new(FileStore::open(&path)), Duration::minutes(10));
        assert_eq!(reopened.get("NVDA", now), Some("cached".to_string()));
        assert!(!path.with_extension("tmp").exists());
    }
}
