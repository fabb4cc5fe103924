//! Capacity-based eviction of the least recently used key directories

use crate::index::CacheIndex;
use crate::layout::Layout;
use crate::types::{CacheEntry, ReclaimReport};
use tracing::{debug, info, warn};

/// Occupancy the sweep reduces to, rounded down to whole bytes
pub(crate) fn target_bytes(capacity: u64, target_ratio: f64) -> u64 {
    (capacity as f64 * target_ratio).floor() as u64
}

/// Sort entries oldest first; ties fall back to key order
pub fn eviction_order(mut entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    entries.sort_by(|a, b| a.recency.cmp(&b.recency).then_with(|| a.key.cmp(&b.key)));
    entries
}

/// Remove the oldest entries until occupancy is at or below
/// `capacity * target_ratio`. The caller must hold the store lock for the
/// whole call.
pub(crate) async fn reclaim(
    index: &mut CacheIndex,
    layout: &Layout,
    capacity: u64,
    target_ratio: f64,
) -> ReclaimReport {
    let target = target_bytes(capacity, target_ratio);
    let mut occupancy = index.total_occupancy();
    let mut report = ReclaimReport {
        remaining_bytes: occupancy,
        ..ReclaimReport::default()
    };

    if occupancy <= target {
        debug!(occupancy, target, "Occupancy within target, nothing to reclaim");
        return report;
    }

    info!(occupancy, capacity, target, "Trimming the cache");

    for entry in eviction_order(index.snapshot_entries()) {
        if occupancy <= target {
            break;
        }
        if let Err(e) = layout.remove_key(&entry.key).await {
            warn!(key = %entry.key, error = %e, "Failed to remove key directory, keeping entry");
            continue;
        }
        index.remove(&entry.key);
        occupancy -= entry.total_bytes;
        report.freed_bytes += entry.total_bytes;
        debug!(key = %entry.key, bytes = entry.total_bytes, "Evicted cache entry");
        report.removed.push(entry.key);
    }

    report.remaining_bytes = occupancy;
    info!(
        removed = report.removed.len(),
        freed_bytes = report.freed_bytes,
        remaining_bytes = report.remaining_bytes,
        "Cache trimmed"
    );
    report
}
