//! Cache layer that runs the caching strategies against the network.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::registry::{Partition, PartitionKind, Partitions};
use super::storage::CacheStorage;
use super::traits::Served;
use crate::net::{Fetcher, Request, Response};

/// Body of the placeholder served when a local resource is unreachable.
pub const DEFAULT_OFFLINE_BODY: &str = "Offline mode: unable to load resource";

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network, providing
/// cache-first and network-first strategies over the partition registry.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  partitions: Arc<Partitions<S>>,
  fetcher: Arc<F>,
  offline_body: Arc<str>,
  /// Cache writes that the response path did not wait for
  pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStorage + 'static, F: Fetcher> CacheLayer<S, F> {
  pub fn new(partitions: Arc<Partitions<S>>, fetcher: Arc<F>) -> Self {
    Self {
      partitions,
      fetcher,
      offline_body: Arc::from(DEFAULT_OFFLINE_BODY),
      pending: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Set the body of the offline placeholder response.
  pub fn with_offline_body(mut self, body: &str) -> Self {
    self.offline_body = Arc::from(body);
    self
  }

  /// Cache-first strategy for local resources.
  ///
  /// 1. Check every partition - on a hit, return it without touching the network
  /// 2. On a miss, fetch from network; successful GETs go into the dynamic partition
  /// 3. On network failure, return a 503 placeholder
  ///
  /// Never fails: the caller always gets a response.
  pub async fn cache_first(&self, request: &Request) -> Served {
    match self.partitions.match_any(request) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, "cache hit");
        return Served::from_cache(cached.response, cached.cached_at);
      }
      Ok(None) => debug!(url = %request.url, "cache miss"),
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed, treating as miss"),
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if is_cacheable(request, &response) {
          self.cache_deferred(PartitionKind::Dynamic, request, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        error!(url = %request.url, error = %e, "network request failed, serving offline placeholder");
        Served::offline(Response::offline(&self.offline_body))
      }
    }
  }

  /// Network-first strategy for CDN resources.
  ///
  /// 1. Fetch from network - successful GETs overwrite the static partition copy
  /// 2. On network failure, fall back to any cached copy
  /// 3. With nothing cached, the network error is returned to the caller
  pub async fn network_first(&self, request: &Request) -> Result<Served> {
    let network_error = match self.fetcher.fetch(request).await {
      Ok(response) => {
        if is_cacheable(request, &response) {
          self.cache_deferred(PartitionKind::Static, request, &response);
        }
        return Ok(Served::from_network(response));
      }
      Err(e) => e,
    };

    warn!(url = %request.url, error = %network_error, "network failed, falling back to cache");

    match self.partitions.match_any(request) {
      Ok(Some(cached)) => Ok(Served::from_cache(cached.response, cached.cached_at)),
      Ok(None) => Err(network_error),
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache fallback lookup failed");
        Err(network_error)
      }
    }
  }

  /// Open the partition for `kind` now and write to it in the background.
  fn cache_deferred(&self, kind: PartitionKind, request: &Request, response: &Response) {
    match self.partitions.open(kind) {
      Ok(partition) => self.store_deferred(partition, request, response),
      Err(e) => error!(url = %request.url, ?kind, error = %e, "failed to open partition"),
    }
  }

  /// Write a copy of the response without blocking the caller on it.
  ///
  /// Failures are only logged. The write may outlive the request that
  /// triggered it; if the partition is deleted in the meantime the write is
  /// dropped rather than bringing the partition back.
  fn store_deferred(&self, partition: Partition<S>, request: &Request, response: &Response) {
    let request = request.clone();
    let response = response.clone();

    let handle = tokio::task::spawn_blocking(move || {
      match partition.put(&request, &response) {
        Ok(()) => debug!(url = %request.url, partition = partition.name(), "cached response"),
        Err(e) => error!(url = %request.url, error = %e, "failed to cache response"),
      }
    });

    if let Ok(mut pending) = self.pending.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Wait for all outstanding deferred writes.
  pub async fn settle(&self) {
    let handles = self
      .pending
      .lock()
      .map(|mut pending| std::mem::take(&mut *pending))
      .unwrap_or_default();

    for handle in handles {
      if let Err(e) = handle.await {
        error!(error = %e, "deferred cache write did not complete");
      }
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      partitions: Arc::clone(&self.partitions),
      fetcher: Arc::clone(&self.fetcher),
      offline_body: Arc::clone(&self.offline_body),
      pending: Arc::clone(&self.pending),
    }
  }
}

/// Only complete (200) responses to GET requests are worth keeping.
fn is_cacheable(request: &Request, response: &Response) -> bool {
  request.is_get() && response.status == 200
}
