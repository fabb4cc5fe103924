//! Artifact store: the on-disk layout plus its index behind one lock

use crate::error::Result;
use crate::eviction;
use crate::index::CacheIndex;
use crate::layout::{validate_artifact_name, validate_key, Layout, PendingUpload};
use crate::types::{CacheEntry, CacheStats, ReclaimReport};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An artifact opened for streaming to a client
#[derive(Debug)]
pub struct FetchedArtifact {
    pub file: File,
    pub size: u64,
}

/// Filesystem-backed artifact store.
///
/// Every index read or write, and the directory measurement that follows a
/// write, happens while holding `index`. Payload bytes are streamed outside
/// the lock; an artifact only becomes visible through the rename performed
/// in [`ArtifactStore::commit`].
pub struct ArtifactStore {
    layout: Layout,
    index: Mutex<CacheIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ArtifactStore {
    /// Prepare the cache root and rebuild the index from disk
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Layout::new(root);
        layout.init().await?;
        layout.sweep_stale_uploads().await?;

        let mut index = CacheIndex::new();
        index.rebuild(&layout).await?;
        info!(root = ?layout.root(), entries = index.len(), "Artifact store ready");

        Ok(Self {
            layout,
            index: Mutex::new(index),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub async fn begin_upload(&self) -> Result<PendingUpload> {
        self.layout.begin_upload().await
    }

    /// Publish a fully received upload and record the key in the index.
    /// Returns the key's new total size.
    pub async fn commit(&self, upload: PendingUpload, key: &str, artifact: &str) -> Result<u64> {
        let received = upload.received();
        let mut index = self.index.lock().await;
        self.layout.publish(upload, key, artifact).await?;
        // The artifact is already in place, so the key must be indexed either way
        let total_bytes = match self.layout.directory_size(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let estimate = estimated_total(index.get(key), received);
                warn!(key, error = %e, estimate, "Could not measure key directory");
                estimate
            }
        };
        index.upsert(key, total_bytes);
        debug!(key, artifact, total_bytes, "Stored artifact");
        Ok(total_bytes)
    }

    /// Receive `declared_size` bytes from `reader` and store them as
    /// `<key>/<artifact>`. On any failure the temp file is discarded and the
    /// index is left untouched.
    pub async fn store<R>(
        &self,
        key: &str,
        artifact: &str,
        reader: &mut R,
        declared_size: u64,
        buffer_size: usize,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        validate_key(key)?;
        validate_artifact_name(artifact)?;

        let mut upload = self.begin_upload().await?;
        if let Err(e) = upload.receive(reader, declared_size, buffer_size).await {
            upload.discard().await;
            return Err(e);
        }
        self.commit(upload, key, artifact).await
    }

    /// Open an artifact for reading, or `None` when it is not cached.
    /// The caller should [`touch`](Self::touch) the key once it has been sent.
    pub async fn open_artifact(
        &self,
        key: &str,
        artifact: &str,
    ) -> Result<Option<FetchedArtifact>> {
        validate_key(key)?;
        validate_artifact_name(artifact)?;

        let path = self.layout.path_for(key, artifact);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, artifact, "Cache miss");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key, artifact, size = metadata.len(), "Cache hit");
        Ok(Some(FetchedArtifact {
            file,
            size: metadata.len(),
        }))
    }

    /// Refresh a key's recency after a successful retrieval
    pub async fn touch(&self, key: &str) -> bool {
        self.index.lock().await.touch(key)
    }

    pub async fn list_keys(&self) -> Vec<String> {
        self.index.lock().await.snapshot_keys()
    }

    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.index.lock().await.get(key).cloned()
    }

    pub async fn occupancy(&self) -> u64 {
        self.index.lock().await.total_occupancy()
    }

    /// Evict least recently used keys until occupancy is at or below
    /// `capacity * target_ratio`. Blocks every other index operation for the
    /// duration of the sweep.
    pub async fn reclaim(&self, capacity: u64, target_ratio: f64) -> ReclaimReport {
        let mut index = self.index.lock().await;
        eviction::reclaim(&mut index, &self.layout, capacity, target_ratio).await
    }

    /// Drop every entry and delete every key directory.
    /// Returns the number of entries removed from the index.
    pub async fn reset(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let removed = index.len();
        index.clear();

        let mut shards = fs::read_dir(self.layout.root()).await?;
        while let Some(shard) = shards.next_entry().await? {
            let name = shard.file_name();
            let name = name.to_string_lossy();
            if name.chars().count() != 2 || name.starts_with('.') {
                continue;
            }
            match shard.file_type().await {
                Ok(t) if t.is_dir() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(shard = %name, error = %e, "Failed to inspect shard during reset");
                    continue;
                }
            }
            if let Err(e) = fs::remove_dir_all(shard.path()).await {
                warn!(shard = %name, error = %e, "Failed to remove shard during reset");
            }
        }

        info!(removed, "Cache reset");
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.len(),
            total_size: index.total_occupancy(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Size to record when a published key directory cannot be listed.
/// Overcounts on overwrite, which only makes the key an earlier eviction candidate.
fn estimated_total(previous: Option<&CacheEntry>, received: u64) -> u64 {
    previous
        .map(|entry| entry.total_bytes)
        .unwrap_or(0)
        .saturating_add(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn put(store: &ArtifactStore, key: &str, artifact: &str, data: &[u8]) -> u64 {
        let mut reader = data;
        store
            .store(key, artifact, &mut reader, data.len() as u64, 64)
            .await
            .unwrap()
    }

    async fn read_back(store: &ArtifactStore, key: &str, artifact: &str) -> Option<Vec<u8>> {
        let fetched = store.open_artifact(key, artifact).await.unwrap()?;
        let mut data = Vec::new();
        let mut file = fetched.file;
        file.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len() as u64, fetched.size);
        Some(data)
    }

    /// Key directories on disk mapped to their summed artifact sizes
    fn disk_usage(root: &Path) -> BTreeMap<String, u64> {
        let mut usage = BTreeMap::new();
        for shard in std::fs::read_dir(root).unwrap() {
            let shard = shard.unwrap();
            if !shard.file_type().unwrap().is_dir() {
                continue;
            }
            for key_dir in std::fs::read_dir(shard.path()).unwrap() {
                let key_dir = key_dir.unwrap();
                let total = std::fs::read_dir(key_dir.path())
                    .unwrap()
                    .map(|f| f.unwrap().metadata().unwrap().len())
                    .sum();
                usage.insert(key_dir.file_name().to_string_lossy().into_owned(), total);
            }
        }
        usage
    }

    async fn assert_index_matches_disk(store: &ArtifactStore) {
        let disk = disk_usage(store.root());
        let keys: BTreeSet<String> = store.list_keys().await.into_iter().collect();
        assert_eq!(keys, disk.keys().cloned().collect::<BTreeSet<_>>());
        for (key, bytes) in disk {
            assert_eq!(store.entry(&key).await.unwrap().total_bytes, bytes);
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        put(&store, "ab12", "out.o", &[b'X'; 1000]).await;
        put(&store, "ab12", "out.d", b"deps").await;

        assert_eq!(read_back(&store, "ab12", "out.o").await.unwrap(), vec![b'X'; 1000]);
        assert_eq!(read_back(&store, "ab12", "out.d").await.unwrap(), b"deps");
        assert!(read_back(&store, "ab12", "other").await.is_none());
        assert_eq!(store.entry("ab12").await.unwrap().total_bytes, 1004);
        assert_index_matches_disk(&store).await;
    }

    #[tokio::test]
    async fn test_overwrite_recomputes_size() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        put(&store, "ab12", "out.o", b"0123456789").await;
        let total = put(&store, "ab12", "out.o", b"01").await;
        assert_eq!(total, 2);
        assert_eq!(store.occupancy().await, 2);
    }

    #[tokio::test]
    async fn test_truncated_store_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        let mut reader: &[u8] = b"only a few bytes";
        let err = store
            .store("ab12", "out.o", &mut reader, 1000, 64)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TruncatedTransfer { .. }));

        assert!(store.list_keys().await.is_empty());
        assert!(!store.layout().path_for("ab12", "out.o").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_names() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        let mut reader: &[u8] = b"x";
        let err = store
            .store("ab12", "..", &mut reader, 1, 64)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
        assert!(store.open_artifact("../etc", "passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_counts_hits_and_misses() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        assert!(store.open_artifact("ab12", "out.o").await.unwrap().is_none());
        put(&store, "ab12", "out.o", b"data").await;
        assert!(store.open_artifact("ab12", "out.o").await.unwrap().is_some());

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size, 4);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        {
            let store = ArtifactStore::open(dir.path()).await.unwrap();
            put(&store, "ab12", "out.o", b"0123456789").await;
            put(&store, "cd34", "out.o", b"01234").await;
        }

        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list_keys().await, vec!["ab12", "cd34"]);
        assert_eq!(store.occupancy().await, 15);
        assert_index_matches_disk(&store).await;
    }

    #[tokio::test]
    async fn test_fetched_key_outlives_untouched_key() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        put(&store, "aa11", "blob", &[0u8; 100]).await;
        put(&store, "bb22", "blob", &[0u8; 100]).await;
        assert!(store.touch("aa11").await);

        let report = store.reclaim(200, 0.5).await;
        assert_eq!(report.removed, vec!["bb22"]);
        assert_eq!(store.list_keys().await, vec!["aa11"]);
        assert_index_matches_disk(&store).await;
    }

    #[tokio::test]
    async fn test_reclaim_converges_for_any_ratio() {
        for ratio in [0.1, 0.25, 0.5, 0.75, 0.9] {
            let dir = tempdir().unwrap();
            let store = ArtifactStore::open(dir.path()).await.unwrap();
            for i in 0..10 {
                put(&store, &format!("k{:03}", i), "blob", &vec![1u8; 10 * (i + 1)]).await;
            }

            let capacity = 400;
            store.reclaim(capacity, ratio).await;
            assert!(store.occupancy().await as f64 <= capacity as f64 * ratio);
            assert_index_matches_disk(&store).await;
        }
    }

    #[tokio::test]
    async fn test_reset_removes_everything() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        put(&store, "ab12", "out.o", b"data").await;
        put(&store, "cd34", "out.o", b"data").await;

        assert_eq!(store.reset().await.unwrap(), 2);
        assert!(store.list_keys().await.is_empty());
        assert_eq!(store.occupancy().await, 0);
        assert!(disk_usage(store.root()).is_empty());
    }

    #[tokio::test]
    async fn test_dot_prefixed_keys_never_reach_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = ArtifactStore::open(&root).await.unwrap();

        for key in ["..evil", ".a12", "..x", ".ab"] {
            let mut reader: &[u8] = b"pwned";
            let err = store
                .store(key, "out.o", &mut reader, 5, 64)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(_)));
            assert!(store.open_artifact(key, "out.o").await.is_err());
        }
        assert!(!dir.path().join("..evil").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        put(&store, "ab12", "out.o", b"data").await;
        drop(store);
        let store = ArtifactStore::open(&root).await.unwrap();
        assert_eq!(store.list_keys().await, vec!["ab12"]);
        assert_index_matches_disk(&store).await;
        assert_eq!(store.reset().await.unwrap(), 1);
        assert!(disk_usage(store.root()).is_empty());
    }

    #[tokio::test]
    async fn test_reset_leaves_stray_root_files() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        put(&store, "ab12", "out.o", b"data").await;
        std::fs::write(dir.path().join("zz"), b"not a shard").unwrap();

        assert_eq!(store.reset().await.unwrap(), 1);
        assert!(dir.path().join("zz").exists());
        assert!(!store.layout().key_dir("ab12").exists());
    }

    #[test]
    fn test_estimated_total_adds_upload_to_previous_size() {
        let entry = CacheEntry {
            key: "ab12".to_string(),
            recency: chrono::Utc::now(),
            total_bytes: 40,
        };
        assert_eq!(estimated_total(Some(&entry), 10), 50);
        assert_eq!(estimated_total(None, 10), 10);
        assert_eq!(estimated_total(Some(&entry), u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_listing_is_stable() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        put(&store, "cd34", "a", b"1").await;
        put(&store, "ab12", "a", b"1").await;

        assert_eq!(store.list_keys().await, store.list_keys().await);
        assert_eq!(store.list_keys().await, vec!["ab12", "cd34"]);
    }
}
