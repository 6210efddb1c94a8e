//! Content-addressed cache for generated artifacts.
//!
//! One cache instance manages one directory (images or audio). Every
//! entry is two files: the raw blob named `<fingerprint>.<format>` and
//! a sibling `.meta` JSON describing it. The in-memory index is
//! rebuilt from the meta files at start-up; entries past their TTL are
//! deleted on sight. Overflow evicts the least recently accessed
//! entry. Blob I/O happens under the index lock, which is fine for a
//! single-host deployment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// MD5 hex digest of a canonical request serialization.
pub fn fingerprint(canonical: &str) -> String {
    format!("{:x}", Md5::digest(canonical.as_bytes()))
}

/// Metadata stored beside every blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub file_path: PathBuf,
    pub source_text: String,
    #[serde(default)]
    pub options: Value,
    pub format: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub byte_size: u64,
}

/// Cache performance counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_entries: usize,
    pub total_bytes: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Fingerprint-addressed blob cache with TTL and LRU eviction.
pub struct AssetCache {
    dir: PathBuf,
    max_entries: usize,
    ttl: Duration,
    index: RwLock<Index>,
}

impl AssetCache {
    /// A zero `ttl` disables expiry.
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_entries,
            ttl,
            index: RwLock::new(Index::default()),
        }
    }

    /// Scan the directory, loading meta files and deleting expired
    /// pairs. Returns the number of entries loaded.
    pub fn initialize(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)?;
        let mut index = self.index.write().unwrap();
        let now = Utc::now();
        for item in std::fs::read_dir(&self.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(mut entry) = serde_json::from_slice::<CacheEntry>(&data) else {
                continue;
            };
            if self.expired(&entry, now) {
                let _ = std::fs::remove_file(&entry.file_path);
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if let Ok(meta) = std::fs::metadata(&entry.file_path) {
                entry.byte_size = meta.len();
            }
            index.entries.insert(entry.fingerprint.clone(), entry);
        }
        Ok(index.entries.len())
    }

    fn expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        !self.ttl.is_zero() && now - entry.created_at > self.ttl
    }

    fn blob_path(&self, fp: &str, format: &str) -> PathBuf {
        self.dir.join(format!("{fp}.{format}"))
    }

    fn meta_path(entry_path: &PathBuf) -> PathBuf {
        let mut meta = entry_path.as_os_str().to_owned();
        meta.push(".meta");
        PathBuf::from(meta)
    }

    /// Fetch a cached blob. Expired entries are deleted and count as a
    /// miss.
    pub fn get(&self, fp: &str) -> Result<Vec<u8>> {
        let mut index = self.index.write().unwrap();
        let now = Utc::now();
        let Some(entry) = index.entries.get_mut(fp) else {
            index.misses += 1;
            return Err(Error::CacheMiss(fp.to_string()));
        };
        if !self.ttl.is_zero() && now - entry.created_at > self.ttl {
            let _ = std::fs::remove_file(&entry.file_path);
            let _ = std::fs::remove_file(Self::meta_path(&entry.file_path));
            index.entries.remove(fp);
            index.misses += 1;
            return Err(Error::CacheMiss(format!("{fp} expired")));
        }
        entry.last_accessed = now;
        entry.access_count += 1;
        let path = entry.file_path.clone();
        index.hits += 1;
        Ok(std::fs::read(path)?)
    }

    /// Store a blob and its metadata. Blob first, then meta, so a
    /// crash between the two leaves no indexed entry.
    pub fn put(
        &self,
        fp: &str,
        data: &[u8],
        source_text: &str,
        options: Value,
        format: &str,
        duration_secs: Option<f64>,
    ) -> Result<()> {
        let mut index = self.index.write().unwrap();
        let path = self.blob_path(fp, format);
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, data)?;

        let now = Utc::now();
        let entry = CacheEntry {
            fingerprint: fp.to_string(),
            file_path: path.clone(),
            source_text: source_text.to_string(),
            options,
            format: format.to_string(),
            duration_secs,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            byte_size: data.len() as u64,
        };
        std::fs::write(Self::meta_path(&path), serde_json::to_vec_pretty(&entry)?)?;
        index.entries.insert(fp.to_string(), entry);

        if index.entries.len() > self.max_entries {
            evict_oldest(&mut index);
        }
        Ok(())
    }

    /// Whether a live entry exists for `fp`.
    pub fn contains(&self, fp: &str) -> bool {
        let index = self.index.read().unwrap();
        index
            .entries
            .get(fp)
            .map(|e| !self.expired(e, Utc::now()))
            .unwrap_or(false)
    }

    /// Metadata snapshot for one entry.
    pub fn entry(&self, fp: &str) -> Option<CacheEntry> {
        self.index.read().unwrap().entries.get(fp).cloned()
    }

    /// Drop one entry and its files.
    pub fn invalidate(&self, fp: &str) {
        let mut index = self.index.write().unwrap();
        if let Some(entry) = index.entries.remove(fp) {
            let _ = std::fs::remove_file(&entry.file_path);
            let _ = std::fs::remove_file(Self::meta_path(&entry.file_path));
        }
    }

    /// Drop everything, including the counters.
    pub fn clear(&self) {
        let mut index = self.index.write().unwrap();
        for entry in index.entries.values() {
            let _ = std::fs::remove_file(&entry.file_path);
            let _ = std::fs::remove_file(Self::meta_path(&entry.file_path));
        }
        index.entries.clear();
        index.hits = 0;
        index.misses = 0;
    }

    /// Delete entries older than the TTL. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut index = self.index.write().unwrap();
        let now = Utc::now();
        let ttl = self.ttl;
        let expired: Vec<String> = index
            .entries
            .values()
            .filter(|e| now - e.created_at > ttl)
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in &expired {
            if let Some(entry) = index.entries.remove(fp) {
                let _ = std::fs::remove_file(&entry.file_path);
                let _ = std::fs::remove_file(Self::meta_path(&entry.file_path));
            }
        }
        expired.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let index = self.index.read().unwrap();
        let total = index.hits + index.misses;
        CacheStats {
            hits: index.hits,
            misses: index.misses,
            hit_rate: if total > 0 {
                index.hits as f64 / total as f64
            } else {
                0.0
            },
            total_entries: index.entries.len(),
            total_bytes: index.entries.values().map(|e| e.byte_size).sum(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(index: &mut Index) {
    let oldest = index
        .entries
        .values()
        .min_by_key(|e| e.last_accessed)
        .map(|e| e.fingerprint.clone());
    if let Some(fp) = oldest {
        if let Some(entry) = index.entries.remove(&fp) {
            let _ = std::fs::remove_file(&entry.file_path);
            let _ = std::fs::remove_file(AssetCache::meta_path(&entry.file_path));
            tracing::debug!(fingerprint = %fp, "evicted least recently used entry");
        }
    }
}

/// Run the TTL sweep every `interval` until shutdown.
pub fn spawn_sweeper(
    cache: Arc<AssetCache>,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let removed = cache.sweep_expired();
                    if removed > 0 {
                        tracing::info!(removed, "swept expired cache entries");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(dir: &std::path::Path, max: usize, ttl: Duration) -> AssetCache {
        let cache = AssetCache::new(dir, max, ttl);
        cache.initialize().unwrap();
        cache
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10, Duration::hours(1));
        let fp = fingerprint("prompt|1024x1024|8|7|sdxl||0");
        cache
            .put(&fp, b"imagebytes", "prompt", json!({}), "png", None)
            .unwrap();
        assert_eq!(cache.get(&fp).unwrap(), b"imagebytes");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));
    }

    #[test]
    fn replacing_an_entry_does_not_grow_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10, Duration::hours(1));
        cache.put("fp", b"one", "t", json!({}), "png", None).unwrap();
        cache.put("fp", b"two", "t", json!({}), "png", None).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fp").unwrap(), b"two");
    }

    #[test]
    fn overflow_evicts_the_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 2, Duration::hours(1));
        cache.put("a", b"a", "t", json!({}), "png", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put("b", b"b", "t", json!({}), "png", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Touch "a" so "b" is now the oldest access.
        cache.get("a").unwrap();
        cache.put("c", b"c", "t", json!({}), "png", None).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn expired_entries_miss_and_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10, Duration::milliseconds(30));
        cache.put("fp", b"x", "t", json!({}), "png", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(matches!(cache.get("fp"), Err(Error::CacheMiss(_))));
        assert_eq!(cache.len(), 0);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 1));
    }

    #[test]
    fn index_rebuilds_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache(dir.path(), 10, Duration::hours(1));
            cache
                .put("fp", b"persisted", "prompt", json!({"w": 512}), "png", None)
                .unwrap();
        }
        let reloaded = AssetCache::new(dir.path(), 10, Duration::hours(1));
        assert_eq!(reloaded.initialize().unwrap(), 1);
        assert_eq!(reloaded.get("fp").unwrap(), b"persisted");
        let entry = reloaded.entry("fp").unwrap();
        assert_eq!(entry.source_text, "prompt");
        assert_eq!(entry.byte_size, 9);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 10, Duration::milliseconds(30));
        cache.put("old", b"x", "t", json!({}), "png", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(60));
        cache.put("new", b"y", "t", json!({}), "png", None).unwrap();
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.contains("new"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn fingerprints_are_stable_md5() {
        assert_eq!(fingerprint("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}
