//! Logical partitions and the version tags that name them.

use color_eyre::Result;
use serde::Deserialize;
use std::sync::Arc;

use super::storage::{CacheStorage, CachedResponse};
use crate::net::{Request, Response};

/// Logical cache partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
  /// Application shell assets plus network-first CDN copies
  Static,
  /// Responses discovered and cached at runtime
  Dynamic,
}

/// The current generation of each partition kind.
///
/// Bumping a tag on deployment is the only way old generations get
/// invalidated: anything not named here is deleted on activation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionTags {
  #[serde(rename = "static")]
  pub static_tag: String,
  #[serde(rename = "dynamic")]
  pub dynamic_tag: String,
  /// Combined tag from before the static/dynamic split. Never opened, only
  /// recognized when it is cleaned up.
  #[serde(rename = "legacy")]
  pub legacy_tag: String,
}

impl Default for VersionTags {
  fn default() -> Self {
    Self {
      static_tag: "static-v1.0.1".to_string(),
      dynamic_tag: "dynamic-v1.0.1".to_string(),
      legacy_tag: "class-points-v1.0.2".to_string(),
    }
  }
}

impl VersionTags {
  pub fn name_of(&self, kind: PartitionKind) -> &str {
    match kind {
      PartitionKind::Static => &self.static_tag,
      PartitionKind::Dynamic => &self.dynamic_tag,
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_tag || name == self.dynamic_tag
  }

  pub fn is_legacy(&self, name: &str) -> bool {
    name == self.legacy_tag
  }
}

/// Maps partition kinds to physical partitions in a storage backend.
pub struct Partitions<S: CacheStorage> {
  storage: Arc<S>,
  tags: VersionTags,
}

impl<S: CacheStorage> Partitions<S> {
  pub fn new(storage: Arc<S>, tags: VersionTags) -> Self {
    Self { storage, tags }
  }

  pub fn tags(&self) -> &VersionTags {
    &self.tags
  }

  /// Open the current partition for `kind`, creating it on first use.
  pub fn open(&self, kind: PartitionKind) -> Result<Partition<S>> {
    let name = self.tags.name_of(kind).to_string();
    self.storage.open(&name)?;

    Ok(Partition {
      name,
      storage: Arc::clone(&self.storage),
    })
  }

  /// Unscoped lookup across every partition.
  pub fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.match_any(request)
  }

  pub fn names(&self) -> Result<Vec<String>> {
    self.storage.partition_names()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_partition(name)
  }

  pub fn entry_count(&self, name: &str) -> Result<usize> {
    self.storage.entry_count(name)
  }
}

/// Handle to one opened partition.
pub struct Partition<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Partition<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  #[allow(dead_code)]
  pub fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.match_in(&self.name, request)
  }

  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(&self.name, request, response)
  }

  pub fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;

  #[test]
  fn test_tags_classify_names() {
    let tags = VersionTags::default();
    assert!(tags.is_current("static-v1.0.1"));
    assert!(tags.is_current("dynamic-v1.0.1"));
    assert!(!tags.is_current("class-points-v1.0.2"));
    assert!(tags.is_legacy("class-points-v1.0.2"));
    assert!(!tags.is_current("static-v1.0.0"));
  }

  #[test]
  fn test_open_is_lazy_and_named_by_tag() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let partitions = Partitions::new(storage, VersionTags::default());
    assert!(partitions.names().unwrap().is_empty());

    let dynamic = partitions.open(PartitionKind::Dynamic).unwrap();
    assert_eq!(dynamic.name(), "dynamic-v1.0.1");
    assert_eq!(partitions.names().unwrap(), vec!["dynamic-v1.0.1"]);
  }

  #[test]
  fn test_partition_handle_round_trip() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let partitions = Partitions::new(storage, VersionTags::default());
    let static_partition = partitions.open(PartitionKind::Static).unwrap();

    let request = Request::parse("GET", "https://app.example.com/script.js").unwrap();
    static_partition
      .put(&request, &Response::new(200, "OK", "console.log(1)"))
      .unwrap();

    assert!(static_partition.match_request(&request).unwrap().is_some());
    assert!(partitions.match_any(&request).unwrap().is_some());
    assert_eq!(partitions.entry_count("static-v1.0.1").unwrap(), 1);
  }
}
