//! In-memory index of key directories
//!
//! The index is rebuilt once at startup from the on-disk layout and is
//! mutated in place afterwards. It carries no lock of its own: the owning
//! [`crate::ArtifactStore`] serializes every access.

use crate::error::Result;
use crate::layout::{scan_dir, validate_key, Layout};
use crate::types::CacheEntry;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Maps cache keys to their recency and byte size
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    /// Latest recency value handed out, used to keep stamps strictly increasing
    last_stamp: Option<DateTime<Utc>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the index and repopulate it from the shard/key directories on disk
    pub async fn rebuild(&mut self, layout: &Layout) -> Result<()> {
        self.entries.clear();
        self.last_stamp = None;

        let mut shards = fs::read_dir(layout.root()).await?;
        while let Some(shard) = shards.next_entry().await? {
            let name = shard.file_name();
            let name = name.to_string_lossy();
            if name.chars().count() != 2 || name.starts_with('.') {
                continue;
            }
            match shard.file_type().await {
                Ok(t) if t.is_dir() => {}
                _ => continue,
            }
            if let Err(e) = self.scan_shard(layout, &shard.path()).await {
                warn!(shard = %name, error = %e, "Skipping unreadable shard");
            }
        }

        info!(
            entries = self.entries.len(),
            total_bytes = self.total_occupancy(),
            "Index rebuilt"
        );
        Ok(())
    }

    async fn scan_shard(&mut self, layout: &Layout, shard: &Path) -> Result<()> {
        let mut keys = fs::read_dir(shard).await?;
        while let Some(key_dir) = keys.next_entry().await? {
            let key = key_dir.file_name().to_string_lossy().into_owned();
            let metadata = match key_dir.metadata().await {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable key directory");
                    continue;
                }
            };
            if validate_key(&key).is_err() || layout.key_dir(&key) != key_dir.path() {
                debug!(key = %key, "Skipping foreign directory");
                continue;
            }

            let (files, total_bytes) = match scan_dir(&key_dir.path()).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable key directory");
                    continue;
                }
            };
            if files == 0 {
                // Empty directories would break the index/disk correspondence
                if let Err(e) = layout.remove_key(&key).await {
                    warn!(key = %key, error = %e, "Failed to remove empty key directory");
                }
                continue;
            }

            let recency = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            self.observe_stamp(recency);
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    recency,
                    total_bytes,
                },
            );
        }
        Ok(())
    }

    /// Insert a key or refresh an existing one with a newly measured size
    pub fn upsert(&mut self, key: &str, total_bytes: u64) -> &CacheEntry {
        let recency = self.next_stamp();
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                key: key.to_string(),
                recency,
                total_bytes,
            });
        entry.recency = recency;
        entry.total_bytes = total_bytes;
        entry
    }

    /// Mark a key as just used. Unknown keys are ignored.
    pub fn touch(&mut self, key: &str) -> bool {
        if !self.entries.contains_key(key) {
            return false;
        }
        let recency = self.next_stamp();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.recency = recency;
        }
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted copy of every key
    pub fn snapshot_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot_entries(&self) -> Vec<CacheEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn total_occupancy(&self) -> u64 {
        self.entries.values().map(|e| e.total_bytes).sum()
    }

    /// Current time, nudged forward so no two stamps are equal
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn observe_stamp(&mut self, stamp: DateTime<Utc>) {
        if self.last_stamp.map_or(true, |last| stamp > last) {
            self.last_stamp = Some(stamp);
        }
    }
}
