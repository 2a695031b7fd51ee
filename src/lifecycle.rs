//! Install/activate/message handling: warming, pruning and resetting the
//! cache partitions.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, PartitionKind, Partitions};
use crate::net::{Fetcher, Request};

/// Control signals the worker sends back to its host platform.
pub trait Platform: Send + Sync {
  /// Activate now instead of waiting for existing clients to close
  fn skip_waiting(&self);
  /// Take control of every open client page without a navigation
  fn claim_clients(&self);
}

/// Platform that records signals in memory.
#[derive(Debug, Default)]
pub struct WorkerState {
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl WorkerState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }
}

impl Platform for WorkerState {
  fn skip_waiting(&self) {
    info!("skip waiting requested");
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  fn claim_clients(&self) {
    info!("claiming open clients");
    self.clients_claimed.store(true, Ordering::SeqCst);
  }
}

/// Messages accepted from client pages, tagged by their `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  SkipWaiting,
  ClearCache,
}

impl Message {
  /// Returns None for payloads without a recognized `type`.
  pub fn parse(payload: &Value) -> Option<Self> {
    Message::deserialize(payload).ok()
  }
}

/// Reacts to platform lifecycle phases.
pub struct Lifecycle<S: CacheStorage, F: Fetcher, P: Platform> {
  partitions: Arc<Partitions<S>>,
  fetcher: Arc<F>,
  platform: Arc<P>,
  scope: Url,
  static_assets: Vec<String>,
}

impl<S: CacheStorage, F: Fetcher, P: Platform> Lifecycle<S, F, P> {
  pub fn new(
    partitions: Arc<Partitions<S>>,
    fetcher: Arc<F>,
    platform: Arc<P>,
    scope: Url,
    static_assets: Vec<String>,
  ) -> Self {
    Self {
      partitions,
      fetcher,
      platform,
      scope,
      static_assets,
    }
  }

  /// Populate the static partition with the application shell.
  ///
  /// Returns whether installation succeeded. Failures are logged and not
  /// retried; the next install attempt starts over.
  pub async fn install(&self) -> bool {
    info!("installing");

    match self.populate_static().await {
      Ok(count) => {
        info!(assets = count, "static assets cached");
        self.platform.skip_waiting();
        true
      }
      Err(e) => {
        error!(error = %e, "install failed");
        false
      }
    }
  }

  /// Fetch every static asset, then write them in one batch.
  ///
  /// Nothing is written unless every asset fetched with an OK status.
  async fn populate_static(&self) -> Result<usize> {
    let partition = self.partitions.open(PartitionKind::Static)?;

    let requests = self
      .static_assets
      .iter()
      .map(|path| {
        self
          .scope
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid static asset path '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let entries = try_join_all(requests.into_iter().map(|request| async move {
      let response = self.fetcher.fetch(&request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Static asset {} returned {} {}",
          request.url,
          response.status,
          response.status_text
        ));
      }
      debug!(url = %request.url, "fetched static asset");
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    partition.put_all(&entries)?;

    Ok(entries.len())
  }

  /// Delete every partition that isn't a current generation, then take
  /// control of open clients.
  ///
  /// Returns the names of the deleted partitions.
  pub async fn activate(&self) -> Vec<String> {
    info!("activating");

    let tags = self.partitions.tags();
    let stale = self.delete_where(|name| !tags.is_current(name));
    self.platform.claim_clients();

    stale
  }

  /// Handle a message payload from a client page.
  pub async fn message(&self, payload: &Value) {
    match Message::parse(payload) {
      Some(Message::SkipWaiting) => self.platform.skip_waiting(),
      Some(Message::ClearCache) => {
        let deleted = self.clear_all();
        info!(count = deleted.len(), "cleared all partitions");
      }
      None => debug!(%payload, "ignoring unrecognized message"),
    }
  }

  /// Delete every partition regardless of tag.
  pub fn clear_all(&self) -> Vec<String> {
    self.delete_where(|_| true)
  }

  fn delete_where(&self, should_delete: impl Fn(&str) -> bool) -> Vec<String> {
    let names = match self.partitions.names() {
      Ok(names) => names,
      Err(e) => {
        error!(error = %e, "failed to list partitions");
        return Vec::new();
      }
    };

    let tags = self.partitions.tags();
    let mut deleted = Vec::new();

    for name in names.into_iter().filter(|name| should_delete(name.as_str())) {
      match self.partitions.delete(&name) {
        Ok(true) => {
          if tags.is_legacy(&name) {
            info!(partition = %name, "deleted legacy partition");
          } else {
            info!(partition = %name, "deleted partition");
          }
          deleted.push(name);
        }
        Ok(false) => {}
        Err(e) => warn!(partition = %name, error = %e, "failed to delete partition"),
      }
    }

    deleted
  }
}
