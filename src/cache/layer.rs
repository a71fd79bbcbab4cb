//! Cache layer that orchestrates the cache-first strategy with network fallback.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStore;
use super::traits::{RequestKey, Served, StoredResponse};
use crate::http::{Network, Request};

/// Cache layer bound to a store and a network.
///
/// The layer never fails: every outcome is a [`Served`] response, possibly
/// a synthetic one.
pub struct CacheLayer {
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
}

impl CacheLayer {
  pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
    Self { store, network }
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  /// Answer a request from `generation`, falling back to the network.
  ///
  /// 1. Check the generation - on a hit, return it without touching the network
  /// 2. On a miss, fetch from the network and store a copy if cacheable
  /// 3. On network failure, serve the offline document for HTML requests,
  ///    otherwise a synthetic 503
  pub async fn fetch(&self, generation: &str, request: Request, offline: &RequestKey) -> Served {
    let key = RequestKey::from_request(&request);

    match self.store.get(generation, &key) {
      Ok(Some(stored)) => {
        debug!(key = %key.description(), generation, "cache hit");
        return Served::from_cache(stored);
      }
      Ok(None) => {}
      Err(e) => warn!(key = %key.description(), "cache lookup failed, treating as miss: {}", e),
    }

    let accepts_html = request.accepts_html();
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          let stored = StoredResponse::from_response(&response, Utc::now());
          // A failed write must not cost the caller its response
          if let Err(e) = self.store.put(generation, &key, &stored) {
            warn!(key = %key.description(), generation, "cache write failed: {}", e);
          }
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(key = %key.description(), "network failed: {}", e);
        if accepts_html {
          match self.store.get(generation, offline) {
            Ok(Some(document)) => return Served::offline_document(document),
            Ok(None) => warn!(generation, "offline document missing from generation"),
            Err(e) => warn!(generation, "offline document lookup failed: {}", e),
          }
        }
        Served::unavailable()
      }
    }
  }

  /// Send a request straight to the network without touching any store.
  pub async fn passthrough(&self, request: Request) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::passthrough(response),
      Err(e) => {
        debug!("passthrough request failed: {}", e);
        Served::unavailable()
      }
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ServeSource, SqliteStore};
  use crate::http::fake::FakeNetwork;
  use crate::http::Response;
  use color_eyre::{eyre::eyre, Result};
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("https://app.test").unwrap().join(path).unwrap()
  }

  fn offline_key() -> RequestKey {
    RequestKey::new("GET", &url("/offline"))
  }

  fn setup() -> (CacheLayer, Arc<SqliteStore>, FakeNetwork) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = FakeNetwork::new();
    let offline = StoredResponse::from_response(&Response::new(200, "you are offline"), Utc::now());
    store
      .create_generation("v1", &[(offline_key(), offline)])
      .unwrap();
    let layer = CacheLayer::new(store.clone(), Arc::new(network.clone()));
    (layer, store, network)
  }

  /// Store whose writes always fail, as if over quota.
  struct QuotaExceeded(SqliteStore);

  impl CacheStore for QuotaExceeded {
    fn names(&self) -> Result<Vec<String>> {
      self.0.names()
    }
    fn has(&self, generation: &str) -> Result<bool> {
      self.0.has(generation)
    }
    fn create_generation(
      &self,
      generation: &str,
      entries: &[(RequestKey, StoredResponse)],
    ) -> Result<()> {
      self.0.create_generation(generation, entries)
    }
    fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
      self.0.get(generation, key)
    }
    fn put(&self, _: &str, _: &RequestKey, _: &StoredResponse) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn delete(&self, generation: &str) -> Result<bool> {
      self.0.delete(generation)
    }
    fn keys(&self, generation: &str) -> Result<Vec<String>> {
      self.0.keys(generation)
    }
  }

  #[tokio::test]
  async fn test_miss_fetches_and_stores() {
    let (layer, store, network) = setup();
    network.route(url("/app.js").as_str(), "console.log(1)");

    let served = layer
      .fetch("v1", Request::get(url("/app.js")), &offline_key())
      .await;
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.body, b"console.log(1)");

    let key = RequestKey::new("GET", &url("/app.js"));
    assert!(store.get("v1", &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_hit_skips_network() {
    let (layer, _store, network) = setup();
    network.route(url("/app.js").as_str(), "console.log(1)");

    layer
      .fetch("v1", Request::get(url("/app.js")), &offline_key())
      .await;
    let calls = network.calls();

    let served = layer
      .fetch("v1", Request::get(url("/app.js")), &offline_key())
      .await;
    assert_eq!(served.source, ServeSource::Cache);
    assert!(served.cached_at.is_some());
    assert_eq!(network.calls(), calls);
  }

  #[tokio::test]
  async fn test_error_responses_are_not_stored() {
    let (layer, store, network) = setup();
    network.route_response(url("/broken").as_str(), Response::new(500, "boom"));

    let served = layer
      .fetch("v1", Request::get(url("/broken")), &offline_key())
      .await;
    assert_eq!(served.response.status, 500);
    assert_eq!(served.source, ServeSource::Network);
    assert!(store
      .get("v1", &RequestKey::new("GET", &url("/broken")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_document() {
    let (layer, _store, network) = setup();
    network.set_offline(true);

    let served = layer
      .fetch("v1", Request::navigate(url("/reports")), &offline_key())
      .await;
    assert_eq!(served.source, ServeSource::OfflineFallback);
    assert_eq!(served.response.body, b"you are offline");
  }

  #[tokio::test]
  async fn test_offline_asset_gets_503() {
    let (layer, _store, network) = setup();
    network.set_offline(true);

    let served = layer
      .fetch("v1", Request::get(url("/data.json")), &offline_key())
      .await;
    assert_eq!(served.source, ServeSource::Unavailable);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_write_failure_still_returns_response() {
    let inner = SqliteStore::in_memory().unwrap();
    inner.create_generation("v1", &[]).unwrap();
    let network = FakeNetwork::new();
    network.route(url("/big.bin").as_str(), "payload");
    let layer = CacheLayer::new(Arc::new(QuotaExceeded(inner)), Arc::new(network));

    let served = layer
      .fetch("v1", Request::get(url("/big.bin")), &offline_key())
      .await;
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.body, b"payload");
  }

  #[tokio::test]
  async fn test_passthrough_never_stores() {
    let (layer, store, network) = setup();
    network.route(url("/api/users").as_str(), "[]");

    let served = layer.passthrough(Request::get(url("/api/users"))).await;
    assert_eq!(served.source, ServeSource::Passthrough);
    assert_eq!(store.keys("v1").unwrap().len(), 1);
  }
}
