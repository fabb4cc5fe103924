//! Filesystem-backed artifact store for the netcache server
//!
//! Artifacts live under `<root>/<key[0:2]>/<key>/<artifact>`. An in-memory
//! index tracks the recency and size of every key directory and is the
//! single source of truth for capacity-based eviction. All index access goes
//! through one exclusive lock owned by [`ArtifactStore`].

mod error;
mod eviction;
mod index;
mod layout;
mod store;
mod types;

pub use error::{Result, StoreError};
pub use eviction::eviction_order;
pub use index::CacheIndex;
pub use layout::{validate_artifact_name, validate_key, Layout, PendingUpload};
pub use store::{ArtifactStore, FetchedArtifact};
pub use types::{CacheEntry, CacheStats, ReclaimReport};
