//! Least-recently-used result cache with time-based expiry
//!
//! Workers share one [`ResultCache`] behind a single lock. Expiry is lazy:
//! an entry older than the TTL is dropped when it is next read, or when
//! [`ResultCache::purge_expired`] runs during memory reclaim.

use crate::models::{CacheStats, ImportSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const SNAPSHOT_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt cache snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Unsupported cache snapshot version {found}")]
    Version { found: u32 },
    #[error("Cache snapshot was written under different settings ({found})")]
    Fingerprint { found: String },
}

/// Identity of a file's content as far as the cache is concerned
///
/// A changed file gets a different key without hashing its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl CacheKey {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }
}

/// Cache used by the scanner
pub type ImportCache = ResultCache<CacheKey, ImportSet>;

struct Entry<V> {
    value: V,
    inserted: Instant,
    inserted_wall: SystemTime,
    /// Access tick, also the entry's key in `Inner::recency`
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn insert(&mut self, key: K, value: V, inserted: Instant, inserted_wall: SystemTime, capacity: usize) {
        if self.remove(&key).is_none() && self.entries.len() >= capacity {
            self.evict_oldest();
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                inserted,
                inserted_wall,
                tick,
            },
        );
    }
}

/// Fixed-capacity LRU cache with TTL
pub struct ResultCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Serialize, Deserialize)]
struct Snapshot<K, V> {
    version: u32,
    /// Identifies the settings the values were produced under
    fingerprint: String,
    entries: Vec<SnapshotEntry<K, V>>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry<K, V> {
    key: K,
    value: V,
    /// Milliseconds since the Unix epoch
    inserted_at: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> ResultCache<K, V> {
    /// Create a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        // Every critical section leaves the maps consistent, so a panic in
        // another holder does not invalidate the state
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or update; at capacity the least recently accessed entry goes
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.lock();
        inner.insert(key, value, Instant::now(), SystemTime::now(), self.capacity);
    }

    /// Look up `key`, refreshing its access time
    ///
    /// An entry older than the TTL is removed and reported absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => now.duration_since(entry.inserted) > self.ttl,
        };

        if expired {
            inner.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.touch(key);
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.inserted) > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            hit_ratio: if lookups > 0 {
                inner.hits as f64 / lookups as f64
            } else {
                0.0
            },
            size: inner.entries.len(),
            capacity: self.capacity,
        }
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Write all live entries to `path` as JSON, tagged with `fingerprint`
    ///
    /// The snapshot is written next to `path` and renamed into place.
    pub fn save_snapshot(&self, path: &Path, fingerprint: &str) -> Result<usize, CacheError> {
        let snapshot = {
            let inner = self.lock();
            let now = Instant::now();
            let mut live: Vec<(&K, &Entry<V>)> = inner
                .entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.inserted) <= self.ttl)
                .collect();
            // Oldest access first so a reload rebuilds the same recency order
            live.sort_by_key(|(_, entry)| entry.tick);

            Snapshot {
                version: SNAPSHOT_VERSION,
                fingerprint: fingerprint.to_string(),
                entries: live
                    .into_iter()
                    .map(|(key, entry)| SnapshotEntry {
                        key: key.clone(),
                        value: entry.value.clone(),
                        inserted_at: entry
                            .inserted_wall
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0),
                    })
                    .collect(),
            }
        };

        let json = serde_json::to_vec(&snapshot)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(snapshot.entries.len())
    }

    /// Load entries from a snapshot written by [`ResultCache::save_snapshot`]
    ///
    /// A missing file loads nothing. Entries already past the TTL are skipped.
    /// A snapshot tagged with a different fingerprint is refused whole.
    pub fn load_snapshot(&self, path: &Path, fingerprint: &str) -> Result<usize, CacheError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot<K, V> = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::Version {
                found: snapshot.version,
            });
        }
        if snapshot.fingerprint != fingerprint {
            return Err(CacheError::Fingerprint {
                found: snapshot.fingerprint,
            });
        }

        let wall_now = SystemTime::now();
        let now = Instant::now();
        let mut loaded = 0;
        let mut inner = self.lock();

        for entry in snapshot.entries {
            let inserted_wall = UNIX_EPOCH + Duration::from_millis(entry.inserted_at);
            // Clock skew into the future counts as fresh
            let age = wall_now.duration_since(inserted_wall).unwrap_or_default();
            if age > self.ttl {
                continue;
            }
            let inserted = now.checked_sub(age).unwrap_or(now);
            inner.insert(entry.key, entry.value, inserted, inserted_wall, self.capacity);
            loaded += 1;
        }

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn cache(capacity: usize) -> ResultCache<String, u32> {
        ResultCache::new(capacity, Duration::from_secs(3600))
    }

    #[test]
    fn test_put_then_get() {
        let cache = cache(4);
        cache.put("a".into(), 1);

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_put_updates_existing_without_eviction() {
        let cache = cache(2);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        cache.put("a".into(), 10);

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(10));
        assert_eq!(cache.get(&"b".to_string()), Some(2));
    }

    #[test]
    fn test_capacity_evicts_least_recently_accessed() {
        let cache = cache(3);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        cache.put("c".into(), 3);

        // Reading "a" makes "b" the oldest access
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.put("d".into(), 4);

        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
        assert_eq!(cache.get(&"d".to_string()), Some(4));
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let cache: ResultCache<String, u32> = ResultCache::new(4, Duration::from_millis(20));
        cache.put("a".into(), 1);
        thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache: ResultCache<String, u32> = ResultCache::new(4, Duration::from_millis(20));
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_and_stats() {
        let cache = cache(4);
        cache.put("a".into(), 1);
        cache.get(&"a".to_string());
        cache.get(&"missing".to_string());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.capacity, 4);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_concurrent_access_respects_capacity() {
        let cache = Arc::new(cache(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("{}-{}", t, i % 20);
                        cache.put(key.clone(), i);
                        cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.size(), 16);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let cache: ImportCache = ResultCache::new(8, Duration::from_secs(3600));
        let key = CacheKey::new("/src/app.py", 42, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut imports = ImportSet::default();
        imports.modules.insert("numpy".to_string());
        cache.put(key.clone(), imports.clone());

        assert_eq!(cache.save_snapshot(&path, "settings-a").unwrap(), 1);

        let restored: ImportCache = ResultCache::new(8, Duration::from_secs(3600));
        assert_eq!(restored.load_snapshot(&path, "settings-a").unwrap(), 1);
        assert_eq!(restored.get(&key), Some(imports));
    }

    #[test]
    fn test_snapshot_with_other_fingerprint_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let original = cache(4);
        original.put("a".into(), 1);
        original.save_snapshot(&path, "lenient").unwrap();

        let restored = cache(4);
        match restored.load_snapshot(&path, "strict") {
            Err(CacheError::Fingerprint { found }) => assert_eq!(found, "lenient"),
            other => panic!("expected fingerprint mismatch, got {:?}", other),
        }
        assert!(restored.is_empty());
    }

    #[test]
    fn test_snapshot_skips_expired_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let json = r#"{"version":2,"fingerprint":"f","entries":[{"key":"old","value":1,"inserted_at":1000}]}"#;
        fs::write(&path, json).unwrap();

        let cache = cache(4);
        assert_eq!(cache.load_snapshot(&path, "f").unwrap(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_snapshot_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = cache(4);
        assert_eq!(cache.load_snapshot(&dir.path().join("absent.json"), "f").unwrap(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{not json").unwrap();

        let cache = cache(4);
        assert!(matches!(cache.load_snapshot(&path, "f"), Err(CacheError::Corrupt(_))));
        assert!(cache.is_empty());
    }
}
