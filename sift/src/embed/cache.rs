//! Embedding cache tiers.
//!
//! Tier 1 is an in-memory LRU capped by entry count with an optional TTL.
//! Tier 2 is a persistent key-value file (redb) capped by byte size, with
//! least-recently-used eviction driven by a logical access counter. Tier 3
//! (the in-database table) lives on the store.
//!
//! All tiers hold the identical little-endian f32 byte representation so
//! coherence can be checked byte-for-byte.

use crate::error::{Error, Result};
use lru::LruCache;
use redb::{ReadableTable, TableDefinition};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache key: a vector is identified by provider, model, and text digest.
/// Valid for any collection sharing the same (provider, model, dimensions).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider_id: String,
    pub model_id: String,
    pub text_digest: String,
}

impl CacheKey {
    pub fn new(provider_id: &str, model_id: &str, text_digest: &str) -> Self {
        CacheKey {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            text_digest: text_digest.to_string(),
        }
    }

    /// Flat key form for the KV tier.
    pub fn kv_key(&self) -> String {
        format!("{}/{}/{}", self.provider_id, self.model_id, self.text_digest)
    }
}

struct MemoryEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// Tier 1: in-memory LRU, capped by entry count.
pub struct MemoryCache {
    inner: Mutex<LruCache<CacheKey, MemoryEntry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ttl) = self.ttl {
            if let Some(entry) = cache.peek(key) {
                if entry.inserted_at.elapsed() > ttl {
                    cache.pop(key);
                    return None;
                }
            }
        }
        cache.get(key).map(|entry| entry.vector.clone())
    }

    pub fn put(&self, key: CacheKey, vector: Vec<f32>) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(
            key,
            MemoryEntry {
                vector,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Approximate resident bytes (vector payloads only).
    pub fn approx_bytes(&self) -> usize {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .iter()
            .map(|(_, entry)| entry.vector.len() * 4)
            .sum()
    }

    /// Drop the least-recently-used entry. Returns false when empty.
    pub fn evict_one(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_lru()
            .is_some()
    }
}

const KV_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("embedding_vectors");
const KV_RECENCY: TableDefinition<&str, u64> = TableDefinition::new("embedding_recency");

fn kv_err(e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("kv cache: {}", e))
}

/// Tier 2: persistent key-value file, capped by total byte size.
///
/// Recency is a logical counter rather than wall-clock time, so eviction
/// order survives clock adjustments.
pub struct KvCache {
    db: redb::Database,
    max_bytes: u64,
    used_bytes: AtomicU64,
    tick: AtomicU64,
}

impl KvCache {
    /// Open or create the cache file.
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let db = redb::Database::create(path.as_ref()).map_err(kv_err)?;

        // Create tables on first open and recover usage accounting.
        let txn = db.begin_write().map_err(kv_err)?;
        let mut used: u64 = 0;
        let mut max_tick: u64 = 0;
        {
            let data = txn.open_table(KV_DATA).map_err(kv_err)?;
            for item in data.iter().map_err(kv_err)? {
                let (key, value) = item.map_err(kv_err)?;
                used += (key.value().len() + value.value().len()) as u64;
            }
            let recency = txn.open_table(KV_RECENCY).map_err(kv_err)?;
            for item in recency.iter().map_err(kv_err)? {
                let (_, tick) = item.map_err(kv_err)?;
                max_tick = max_tick.max(tick.value());
            }
        }
        txn.commit().map_err(kv_err)?;

        Ok(KvCache {
            db,
            max_bytes,
            used_bytes: AtomicU64::new(used),
            tick: AtomicU64::new(max_tick + 1),
        })
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let flat = key.kv_key();
        let value = {
            let txn = self.db.begin_read().map_err(kv_err)?;
            let data = match txn.open_table(KV_DATA) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(kv_err(e)),
            };
            data.get(flat.as_str())
                .map_err(kv_err)?
                .map(|guard| guard.value().to_vec())
        };

        if value.is_some() {
            let txn = self.db.begin_write().map_err(kv_err)?;
            {
                let mut recency = txn.open_table(KV_RECENCY).map_err(kv_err)?;
                recency
                    .insert(flat.as_str(), self.next_tick())
                    .map_err(kv_err)?;
            }
            txn.commit().map_err(kv_err)?;
        }
        Ok(value)
    }

    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let flat = key.kv_key();
        let txn = self.db.begin_write().map_err(kv_err)?;
        {
            let mut data = txn.open_table(KV_DATA).map_err(kv_err)?;
            let previous = data
                .insert(flat.as_str(), bytes)
                .map_err(kv_err)?
                .map(|guard| guard.value().len());
            match previous {
                // Replacement: the key is already accounted, adjust by the
                // value-length delta.
                Some(old_len) if bytes.len() >= old_len => {
                    self.used_bytes
                        .fetch_add((bytes.len() - old_len) as u64, Ordering::SeqCst);
                }
                Some(old_len) => {
                    self.used_bytes
                        .fetch_sub((old_len - bytes.len()) as u64, Ordering::SeqCst);
                }
                None => {
                    self.used_bytes
                        .fetch_add((flat.len() + bytes.len()) as u64, Ordering::SeqCst);
                }
            }

            let mut recency = txn.open_table(KV_RECENCY).map_err(kv_err)?;
            recency
                .insert(flat.as_str(), self.next_tick())
                .map_err(kv_err)?;
        }
        txn.commit().map_err(kv_err)?;

        self.evict_to_cap()
    }

    /// Evict least-recently-used entries until under the byte cap.
    fn evict_to_cap(&self) -> Result<()> {
        while self.used_bytes.load(Ordering::SeqCst) > self.max_bytes {
            let victim = {
                let txn = self.db.begin_read().map_err(kv_err)?;
                let recency = txn.open_table(KV_RECENCY).map_err(kv_err)?;
                let mut oldest: Option<(String, u64)> = None;
                for item in recency.iter().map_err(kv_err)? {
                    let (key, tick) = item.map_err(kv_err)?;
                    let tick = tick.value();
                    if oldest.as_ref().map(|(_, t)| tick < *t).unwrap_or(true) {
                        oldest = Some((key.value().to_string(), tick));
                    }
                }
                oldest
            };

            let Some((victim, _)) = victim else {
                break;
            };

            let txn = self.db.begin_write().map_err(kv_err)?;
            {
                let mut data = txn.open_table(KV_DATA).map_err(kv_err)?;
                if let Some(removed) = data.remove(victim.as_str()).map_err(kv_err)? {
                    let freed = (victim.len() + removed.value().len()) as u64;
                    self.used_bytes.fetch_sub(
                        freed.min(self.used_bytes.load(Ordering::SeqCst)),
                        Ordering::SeqCst,
                    );
                }
                let mut recency = txn.open_table(KV_RECENCY).map_err(kv_err)?;
                recency.remove(victim.as_str()).map_err(kv_err)?;
            }
            txn.commit().map_err(kv_err)?;
            tracing::debug!("kv cache evicted {}", victim);
        }
        Ok(())
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(digest: &str) -> CacheKey {
        CacheKey::new("mock", "mock-v1", digest)
    }

    #[test]
    fn test_memory_lru_eviction() {
        let cache = MemoryCache::new(2, None);
        cache.put(key("a"), vec![1.0]);
        cache.put(key("b"), vec![2.0]);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), vec![3.0]);

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_memory_ttl_expiry() {
        let cache = MemoryCache::new(8, Some(Duration::ZERO));
        cache.put(key("a"), vec![1.0]);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KvCache::open(dir.path().join("cache.redb"), 1 << 20).unwrap();

        assert!(cache.get(&key("a")).unwrap().is_none());
        cache.put(&key("a"), &[1, 2, 3, 4]).unwrap();
        assert_eq!(cache.get(&key("a")).unwrap(), Some(vec![1, 2, 3, 4]));
        assert!(cache.used_bytes() > 0);
    }

    #[test]
    fn test_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        {
            let cache = KvCache::open(&path, 1 << 20).unwrap();
            cache.put(&key("persisted"), &[9, 9, 9, 9]).unwrap();
        }
        let cache = KvCache::open(&path, 1 << 20).unwrap();
        assert_eq!(cache.get(&key("persisted")).unwrap(), Some(vec![9, 9, 9, 9]));
    }

    #[test]
    fn test_kv_byte_cap_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        // Cap small enough that three 40-byte payloads cannot coexist.
        let cache = KvCache::open(dir.path().join("cache.redb"), 160).unwrap();

        cache.put(&key("a"), &[0u8; 40]).unwrap();
        cache.put(&key("b"), &[0u8; 40]).unwrap();
        // Touch "a" so "b" is oldest.
        assert!(cache.get(&key("a")).unwrap().is_some());
        cache.put(&key("c"), &[0u8; 40]).unwrap();

        assert!(cache.get(&key("b")).unwrap().is_none());
        assert!(cache.get(&key("a")).unwrap().is_some());
        assert!(cache.get(&key("c")).unwrap().is_some());
        assert!(cache.used_bytes() <= 160);
    }
}
