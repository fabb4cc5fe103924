//! Store types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Index metadata for one key directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Orders entries for eviction only
    pub recency: DateTime<Utc>,
    pub total_bytes: u64,
}

/// Statistics about the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    /// Keys removed, oldest first
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

impl ReclaimReport {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
    }
}
