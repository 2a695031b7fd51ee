//! The worker: one handler per platform phase, composed at startup.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheLayer, CacheStorage, Partitions, Served};
use crate::config::Config;
use crate::lifecycle::{Lifecycle, Platform};
use crate::net::{Fetcher, Request};
use crate::route::{Classifier, Route};

/// Outcome of intercepting a request.
#[derive(Debug)]
pub enum Intercept {
  /// Declined; the platform performs the request itself
  PassThrough,
  /// Claimed. Only network-first requests without a cached fallback error.
  Respond(Result<Served>),
}

/// Routes platform events to the classifier, strategies and lifecycle.
pub struct Worker<S: CacheStorage, F: Fetcher, P: Platform> {
  classifier: Classifier,
  layer: CacheLayer<S, F>,
  lifecycle: Lifecycle<S, F, P>,
  partitions: Arc<Partitions<S>>,
}

impl<S: CacheStorage + 'static, F: Fetcher, P: Platform> Worker<S, F, P> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>, platform: Arc<P>) -> Self {
    let partitions = Arc::new(Partitions::new(storage, config.tags.clone()));

    let layer = CacheLayer::new(Arc::clone(&partitions), Arc::clone(&fetcher))
      .with_offline_body(&config.offline_body);

    let lifecycle = Lifecycle::new(
      Arc::clone(&partitions),
      fetcher,
      platform,
      config.scope.clone(),
      config.static_assets.clone(),
    );

    Self {
      classifier: Classifier::new(&config.cdn_resources),
      layer,
      lifecycle,
      partitions,
    }
  }

  pub async fn install(&self) -> bool {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Vec<String> {
    self.lifecycle.activate().await
  }

  pub async fn fetch(&self, request: &Request) -> Intercept {
    let route = self.classifier.classify(request);
    debug!(method = %request.method, url = %request.url, ?route, "intercepted");

    match route {
      Route::PassThrough => Intercept::PassThrough,
      Route::Cdn => Intercept::Respond(self.layer.network_first(request).await),
      Route::Local => Intercept::Respond(Ok(self.layer.cache_first(request).await)),
    }
  }

  pub async fn message(&self, payload: &Value) {
    self.lifecycle.message(payload).await
  }

  /// Wait for cache writes still running after their responses were returned.
  pub async fn settle(&self) {
    self.layer.settle().await
  }

  pub fn partitions(&self) -> &Partitions<S> {
    &self.partitions
  }
}
