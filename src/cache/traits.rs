//! Result types shared by the caching strategies.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// A response handed back to the caller, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Create a result from a live network response.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a result from a cached entry.
  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a synthesized placeholder for offline mode.
  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Stored copy from a partition
  Cache,
  /// Network unavailable and nothing cached; synthesized placeholder
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
    };
    f.write_str(label)
  }
}
