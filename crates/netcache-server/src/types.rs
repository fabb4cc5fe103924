//! Core types for the netcache server

use netcache_store::CacheStats;
use serde::{Deserialize, Serialize};

/// Payload of the STATS command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub capacity: u64,
    pub target_ratio: f64,
    pub cache: CacheStats,
}
