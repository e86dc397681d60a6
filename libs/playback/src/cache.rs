//! Budgeted local content cache
//!
//! Blobs are keyed by source URL in a [`BlobStore`]. A manifest of
//! `{url, sizeBytes, cachedAt}` records in insertion order is kept under its
//! own key in the same store. The sum of recorded sizes never exceeds the
//! budget: inserting evicts from the head of the manifest, and a blob larger
//! than the whole budget is refused.
//!
//! Read paths never fail; a broken store reads as an empty cache.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Store key of the manifest; never a valid source URL
pub const MANIFEST_KEY: &str = "cache:manifest";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Blob of {size} bytes exceeds the cache budget of {budget} bytes")]
    TooLargeToCache { size: u64, budget: u64 },

    #[error("Cache store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache manifest could not be encoded: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("{0} is reserved by the cache")]
    ReservedKey(String),
}

/// Generic key-value blob persistence
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError>;
    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        self.blobs.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}

/// Blob store on a local directory
///
/// Each key maps to `<sha256(key)>.blob` plus a `<sha256(key)>.key` file
/// holding the original key. Blobs are written to a temporary file and
/// renamed into place.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.blob", Self::stem(key)))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.key", Self::stem(key)))
    }
}

async fn remove_if_exists(path: &PathBuf) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        let blob = self.blob_path(key);
        let partial = blob.with_extension("partial");
        tokio::fs::write(self.key_path(key), key.as_bytes()).await?;
        tokio::fs::write(&partial, &value).await?;
        tokio::fs::rename(&partial, &blob).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        remove_if_exists(&self.blob_path(key)).await?;
        remove_if_exists(&self.key_path(key)).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }
            if !tokio::fs::try_exists(path.with_extension("blob")).await? {
                continue;
            }
            keys.push(tokio::fs::read_to_string(&path).await?);
        }
        Ok(keys)
    }
}

/// One cached blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub url: String,
    pub size_bytes: u64,
    /// Milliseconds since the Unix epoch
    pub cached_at: i64,
}

pub struct ContentCache {
    store: Arc<dyn BlobStore>,
    budget: u64,
    /// Loaded lazily; every manifest read-modify-write holds this lock
    manifest: Mutex<Option<Vec<CacheEntry>>>,
}

impl ContentCache {
    pub fn new(store: Arc<dyn BlobStore>, budget_bytes: u64) -> Self {
        Self {
            store,
            budget: budget_bytes,
            manifest: Mutex::new(None),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    async fn load_manifest(&self) -> Vec<CacheEntry> {
        match self.store.get(MANIFEST_KEY).await {
            Ok(None) => Vec::new(),
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cache manifest is corrupt, resetting: {}", e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Cache manifest unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn write_manifest(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(entries)?;
        self.store.put(MANIFEST_KEY, Bytes::from(raw)).await
    }

    /// Snapshot of the manifest in insertion order
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let mut guard = self.manifest.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_manifest().await);
        }
        guard.clone().unwrap_or_default()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.entries().await.iter().map(|e| e.size_bytes).sum()
    }

    pub async fn is_cached(&self, url: &str) -> bool {
        self.entries().await.iter().any(|e| e.url == url)
    }

    /// Cached bytes of `url`, if any
    pub async fn get(&self, url: &str) -> Option<Bytes> {
        if !self.is_cached(url).await {
            return None;
        }

        match self.store.get(url).await {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => {
                debug!("Cached blob for {} is missing, dropping entry", url);
                self.forget(url).await;
                None
            }
            Err(e) => {
                warn!("Failed to read cached blob for {}: {}", url, e);
                None
            }
        }
    }

    async fn forget(&self, url: &str) {
        let mut guard = self.manifest.lock().await;
        let mut entries = match guard.take() {
            Some(entries) => entries,
            None => self.load_manifest().await,
        };
        entries.retain(|e| e.url != url);
        if let Err(e) = self.write_manifest(&entries).await {
            warn!("Failed to persist cache manifest: {}", e);
        }
        *guard = Some(entries);
    }

    /// Cache `bytes` under `url`, evicting the oldest entries to stay within budget
    pub async fn put(&self, url: &str, bytes: Bytes) -> Result<(), CacheError> {
        if url == MANIFEST_KEY {
            return Err(CacheError::ReservedKey(url.to_string()));
        }
        let size = bytes.len() as u64;
        if size > self.budget {
            info!("Not caching {} ({} bytes), larger than the cache budget", url, size);
            return Err(CacheError::TooLargeToCache {
                size,
                budget: self.budget,
            });
        }

        let mut guard = self.manifest.lock().await;
        let current = match guard.as_ref() {
            Some(entries) => entries.clone(),
            None => self.load_manifest().await,
        };

        let mut next: Vec<CacheEntry> = current.into_iter().filter(|e| e.url != url).collect();
        let mut total: u64 = next.iter().map(|e| e.size_bytes).sum();
        let mut evicted = Vec::new();
        while total + size > self.budget && !next.is_empty() {
            let oldest = next.remove(0);
            total -= oldest.size_bytes;
            evicted.push(oldest);
        }
        next.push(CacheEntry {
            url: url.to_string(),
            size_bytes: size,
            cached_at: Utc::now().timestamp_millis(),
        });

        self.store.put(url, bytes).await?;
        if let Err(e) = self.write_manifest(&next).await {
            // The blob is unreachable without its manifest entry
            if let Err(rollback) = self.store.delete(url).await {
                warn!("Failed to roll back blob for {}: {}", url, rollback);
            }
            return Err(e);
        }

        for entry in &evicted {
            debug!("Evicted {} ({} bytes) from cache", entry.url, entry.size_bytes);
            if let Err(e) = self.store.delete(&entry.url).await {
                warn!("Failed to delete evicted blob {}: {}", entry.url, e);
            }
        }

        *guard = Some(next);
        Ok(())
    }

    /// Remove every entry and reset the manifest
    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut guard = self.manifest.lock().await;
        for key in self.store.keys().await? {
            if key != MANIFEST_KEY {
                self.store.delete(&key).await?;
            }
        }
        self.write_manifest(&[]).await?;
        *guard = Some(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::media::CACHE_BUDGET_BYTES;

    const MB: usize = 1024 * 1024;

    fn blob(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    fn cache() -> (Arc<MemoryBlobStore>, ContentCache) {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = ContentCache::new(store.clone(), CACHE_BUDGET_BYTES);
        (store, cache)
    }

    /// Store failing every write of the manifest key
    struct ManifestWriteFails(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for ManifestWriteFails {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
            self.0.get(key).await
        }
        async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
            if key == MANIFEST_KEY {
                return Err(CacheError::Unavailable("quota exceeded".to_string()));
            }
            self.0.put(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.0.delete(key).await
        }
        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            self.0.keys().await
        }
    }

    #[tokio::test]
    async fn eviction_follows_insertion_order_not_access() {
        let (store, cache) = cache();
        for url in ["a", "b", "c"] {
            cache.put(url, blob(10 * MB)).await.unwrap();
        }
        // Reading A does not protect it
        assert!(cache.get("a").await.is_some());

        cache.put("d", blob(10 * MB)).await.unwrap();

        let urls: Vec<String> = cache.entries().await.into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["b", "c", "d"]);
        assert!(!cache.is_cached("a").await);
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(cache.total_bytes().await, 30 * MB as u64);
    }

    #[tokio::test]
    async fn blob_larger_than_budget_is_never_cached() {
        let (store, cache) = cache();
        cache.put("small", blob(MB)).await.unwrap();

        let err = cache
            .put("huge", blob(CACHE_BUDGET_BYTES as usize + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TooLargeToCache { .. }));
        assert!(!cache.is_cached("huge").await);
        assert!(store.get("huge").await.unwrap().is_none());
        // Nothing was evicted for it
        assert!(cache.is_cached("small").await);
    }

    #[tokio::test]
    async fn budget_holds_after_every_put() {
        let (_store, cache) = cache();
        let sizes = [12, 20, 3, 35, 1, 17, 17, 9, 30, 2];
        for (n, size) in sizes.iter().enumerate() {
            cache.put(&format!("u{}", n), blob(size * MB)).await.unwrap();
            assert!(cache.total_bytes().await <= CACHE_BUDGET_BYTES);
        }
        // A blob of exactly the budget fits once everything else is gone
        cache.put("full", blob(CACHE_BUDGET_BYTES as usize)).await.unwrap();
        assert_eq!(cache.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn re_caching_a_url_replaces_its_entry() {
        let (_store, cache) = cache();
        cache.put("a", blob(MB)).await.unwrap();
        cache.put("b", blob(MB)).await.unwrap();
        cache.put("a", blob(2 * MB)).await.unwrap();

        let entries = cache.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].url, "a");
        assert_eq!(entries[1].size_bytes, 2 * MB as u64);
    }

    #[tokio::test]
    async fn failed_manifest_write_rolls_back_blob() {
        let store = Arc::new(ManifestWriteFails(MemoryBlobStore::new()));
        let cache = ContentCache::new(store.clone(), CACHE_BUDGET_BYTES);

        assert!(cache.put("a", blob(MB)).await.is_err());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(!cache.is_cached("a").await);
    }

    #[tokio::test]
    async fn manifest_key_cannot_be_cached_over() {
        let (store, cache) = cache();
        cache.put("a", blob(MB)).await.unwrap();
        let manifest = store.get(MANIFEST_KEY).await.unwrap();

        let err = cache.put(MANIFEST_KEY, blob(MB)).await.unwrap_err();
        assert!(matches!(err, CacheError::ReservedKey(_)));
        assert_eq!(store.get(MANIFEST_KEY).await.unwrap(), manifest);
        assert_eq!(cache.entries().await.len(), 1);
        assert!(cache.is_cached("a").await);
    }

    #[tokio::test]
    async fn corrupt_manifest_reads_as_empty() {
        let store = Arc::new(MemoryBlobStore::new());
        store
            .put(MANIFEST_KEY, Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let cache = ContentCache::new(store.clone(), CACHE_BUDGET_BYTES);

        assert!(cache.entries().await.is_empty());
        cache.put("a", blob(MB)).await.unwrap();
        assert!(cache.is_cached("a").await);
    }

    #[tokio::test]
    async fn concurrent_puts_keep_every_entry() {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(ContentCache::new(store.clone(), CACHE_BUDGET_BYTES));

        let tasks: Vec<_> = (0..10)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.put(&format!("u{}", n), blob(MB)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // A fresh instance sees the persisted manifest
        let reloaded = ContentCache::new(store, CACHE_BUDGET_BYTES);
        assert_eq!(reloaded.entries().await.len(), 10);
    }

    #[tokio::test]
    async fn clear_empties_store_and_manifest() {
        let (store, cache) = cache();
        cache.put("a", blob(MB)).await.unwrap();
        cache.put("b", blob(MB)).await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.entries().await.is_empty());
        assert_eq!(store.keys().await.unwrap(), vec![MANIFEST_KEY.to_string()]);
    }

    #[tokio::test]
    async fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(FsBlobStore::open(dir.path()).await.unwrap());
            let cache = ContentCache::new(store, CACHE_BUDGET_BYTES);
            cache
                .put("https://cdn/a/low.mp4", Bytes::from_static(b"low"))
                .await
                .unwrap();
        }

        let store = Arc::new(FsBlobStore::open(dir.path()).await.unwrap());
        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:manifest", "https://cdn/a/low.mp4"]);

        let cache = ContentCache::new(store.clone(), CACHE_BUDGET_BYTES);
        assert_eq!(
            cache.get("https://cdn/a/low.mp4").await,
            Some(Bytes::from_static(b"low"))
        );

        store.delete("https://cdn/a/low.mp4").await.unwrap();
        store.delete("https://cdn/a/low.mp4").await.unwrap();
        assert_eq!(cache.get("https://cdn/a/low.mp4").await, None);
        assert!(!cache.is_cached("https://cdn/a/low.mp4").await);
    }
}
