//! Partitioned response cache for offline support.
//!
//! This module provides:
//! - Named partitions keyed by version tag, created lazily and deleted per generation
//! - Cache-first and network-first strategies over those partitions
//! - A SQLite-backed store addressed by request identity

mod layer;
mod registry;
mod storage;
mod traits;

pub use layer::{CacheLayer, DEFAULT_OFFLINE_BODY};
pub use registry::{PartitionKind, Partitions, VersionTags};
pub use storage::{CacheStorage, SqliteStorage};
#[cfg(test)]
pub use storage::CachedResponse;
pub use traits::{CacheSource, Served};
