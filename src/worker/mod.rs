//! The cache worker: an explicit lifecycle state machine over one generation.
//!
//! A worker is created in `installing`, precaches its manifest into a fresh
//! generation, waits, and on activation deletes every other generation
//! before it starts answering requests. The [`runtime`] drives these
//! transitions; tests may call them directly.

mod manifest;
pub mod runtime;
mod scope;

pub use manifest::PrecacheManifest;
pub use scope::{Disposition, Scope, DEFAULT_EXCLUDED_PREFIXES};

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheStore, RequestKey, Served, StoredResponse};
use crate::http::{Network, Request};
use crate::protocol::{ControlMessage, WorkerId, WorkerState};

/// Errors that can occur driving a worker through its lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
  #[error("Invalid manifest resource: {0}")]
  InvalidResource(String),

  #[error("Failed to precache {url}: {reason}")]
  Precache { url: String, reason: String },

  #[error("Failed to write generation {generation}: {reason}")]
  Store { generation: String, reason: String },

  #[error("Cannot {operation} a worker that is {state}")]
  InvalidState {
    operation: &'static str,
    state: WorkerState,
  },
}

/// A single cache worker instance bound to one generation.
pub struct CacheWorker {
  id: WorkerId,
  manifest: PrecacheManifest,
  scope: Scope,
  state: WorkerState,
  skip_waiting: bool,
  layer: CacheLayer,
  offline_key: RequestKey,
}

impl CacheWorker {
  pub fn new(
    manifest: PrecacheManifest,
    scope: Scope,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
  ) -> Result<Self, WorkerError> {
    let offline_key = manifest
      .offline_key(scope.origin())
      .map_err(|e| WorkerError::InvalidResource(e.to_string()))?;

    Ok(Self {
      id: WorkerId::next(),
      manifest,
      scope,
      state: WorkerState::Installing,
      skip_waiting: false,
      layer: CacheLayer::new(store, network),
      offline_key,
    })
  }

  pub fn id(&self) -> WorkerId {
    self.id
  }

  /// Name of the generation this worker owns.
  pub fn version(&self) -> &str {
    self.manifest.version()
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == WorkerState::Activated
  }

  /// Whether `SKIP_WAITING` has been received.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub(crate) fn set_redundant(&mut self) {
    self.state = WorkerState::Redundant;
  }

  /// Precache every manifest resource into this worker's generation.
  ///
  /// All fetches run concurrently and must all succeed; only then is the
  /// generation written, in one transaction. On failure the worker becomes
  /// redundant and no other generation is touched.
  pub async fn install(&mut self) -> Result<(), WorkerError> {
    if self.state != WorkerState::Installing {
      return Err(WorkerError::InvalidState {
        operation: "install",
        state: self.state,
      });
    }

    match self.precache().await {
      Ok(count) => {
        info!(worker = %self.id, version = self.version(), count, "generation installed");
        self.state = WorkerState::Installed;
        Ok(())
      }
      Err(e) => {
        warn!(worker = %self.id, version = self.version(), "install failed: {}", e);
        self.state = WorkerState::Redundant;
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize, WorkerError> {
    let requests = self
      .manifest
      .requests(self.scope.origin())
      .map_err(|e| WorkerError::InvalidResource(e.to_string()))?;

    let network = self.layer.network();
    let responses = join_all(requests.iter().map(|r| network.fetch(r.clone()))).await;

    let stored_at = Utc::now();
    let mut entries = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(responses) {
      let response = result.map_err(|e| WorkerError::Precache {
        url: request.url.to_string(),
        reason: e.to_string(),
      })?;
      if !response.is_success() {
        return Err(WorkerError::Precache {
          url: request.url.to_string(),
          reason: format!("status {}", response.status),
        });
      }
      entries.push((
        RequestKey::new("GET", &request.url),
        StoredResponse::from_response(&response, stored_at),
      ));
    }

    self
      .layer
      .store()
      .create_generation(self.version(), &entries)
      .map_err(|e| WorkerError::Store {
        generation: self.version().to_string(),
        reason: e.to_string(),
      })?;

    Ok(entries.len())
  }

  /// Handle a control message. Returns true if the worker should be
  /// activated right away.
  pub fn receive(&mut self, message: ControlMessage) -> bool {
    match message {
      ControlMessage::SkipWaiting => {
        debug!(worker = %self.id, state = %self.state, "skip waiting requested");
        self.skip_waiting = true;
        self.state == WorkerState::Installed
      }
    }
  }

  /// Delete every generation but ours, then start serving.
  ///
  /// Returns the names of the deleted generations.
  pub async fn activate(&mut self) -> Result<Vec<String>, WorkerError> {
    if self.state != WorkerState::Installed {
      return Err(WorkerError::InvalidState {
        operation: "activate",
        state: self.state,
      });
    }
    self.state = WorkerState::Activating;

    let store = self.layer.store();
    let names = store.names().map_err(|e| WorkerError::Store {
      generation: self.version().to_string(),
      reason: e.to_string(),
    })?;

    let mut deleted = Vec::new();
    for name in names.into_iter().filter(|n| n != self.version()) {
      match store.delete(&name) {
        Ok(_) => deleted.push(name),
        Err(e) => warn!(generation = %name, "failed to delete stale generation: {}", e),
      }
    }

    info!(worker = %self.id, version = self.version(), ?deleted, "worker activated");
    self.state = WorkerState::Activated;
    Ok(deleted)
  }

  /// A cloneable handle for answering requests, once the worker is active.
  pub fn fetch_handler(&self) -> Option<FetchHandler> {
    self.is_active().then(|| FetchHandler {
      generation: self.version().to_string(),
      scope: self.scope.clone(),
      layer: self.layer.clone(),
      offline_key: self.offline_key.clone(),
    })
  }

  /// Answer an intercepted request.
  ///
  /// A worker that is not yet active never reads its generation: the
  /// request goes to the network untouched.
  pub async fn handle(&self, request: Request) -> Served {
    match self.fetch_handler() {
      Some(handler) => handler.handle(request).await,
      None => self.layer.passthrough(request).await,
    }
  }
}

/// Answers requests from one active generation.
#[derive(Clone)]
pub struct FetchHandler {
  generation: String,
  scope: Scope,
  layer: CacheLayer,
  offline_key: RequestKey,
}

impl FetchHandler {
  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub async fn handle(&self, request: Request) -> Served {
    match self.scope.classify(&request) {
      Disposition::Passthrough => self.layer.passthrough(request).await,
      Disposition::Cacheable => {
        self
          .layer
          .fetch(&self.generation, request, &self.offline_key)
          .await
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ServeSource, SqliteStore};
  use crate::http::fake::FakeNetwork;
  use url::Url;

  const ORIGIN: &str = "https://app.test";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn manifest(version: &str) -> PrecacheManifest {
    PrecacheManifest::new(version, &["/", "/offline", "/manifest", "/icon"], "/offline")
  }

  fn network() -> FakeNetwork {
    let network = FakeNetwork::new();
    network
      .route(url("/").as_str(), "<h1>home</h1>")
      .route(url("/offline").as_str(), "<h1>offline</h1>")
      .route(url("/manifest").as_str(), "{}")
      .route(url("/icon").as_str(), "PNG");
    network
  }

  fn worker(version: &str, store: &Arc<SqliteStore>, network: &FakeNetwork) -> CacheWorker {
    CacheWorker::new(
      manifest(version),
      Scope::new(Url::parse(ORIGIN).unwrap()),
      store.clone(),
      Arc::new(network.clone()),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_every_resource() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    let mut worker = worker("v1", &store, &network);

    worker.install().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Installed);
    for path in ["/", "/offline", "/manifest", "/icon"] {
      let key = RequestKey::new("GET", &url(path));
      assert!(store.get("v1", &key).unwrap().is_some(), "missing {}", path);
    }
    assert!(network
      .requests()
      .iter()
      .all(|r| r.header("cache-control") == Some("no-cache")));
  }

  #[tokio::test]
  async fn test_failed_install_leaves_previous_generation_untouched() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    let mut v1 = worker("v1", &store, &network);
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    let home = RequestKey::new("GET", &url("/"));
    let before = store.get("v1", &home).unwrap();

    network.fail(url("/icon").as_str());
    network.route(url("/").as_str(), "<h1>home v2</h1>");
    let mut v2 = worker("v2", &store, &network);
    let err = v2.install().await.unwrap_err();

    assert!(matches!(err, WorkerError::Precache { .. }));
    assert_eq!(v2.state(), WorkerState::Redundant);
    assert_eq!(store.names().unwrap(), vec!["v1".to_string()]);
    assert_eq!(store.get("v1", &home).unwrap(), before);
  }

  #[tokio::test]
  async fn test_non_success_status_fails_install() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    network.route_response(url("/manifest").as_str(), crate::http::Response::new(404, ""));
    let mut worker = worker("v1", &store, &network);

    assert!(worker.install().await.is_err());
    assert!(!store.has("v1").unwrap());
  }

  #[tokio::test]
  async fn test_activate_deletes_stale_generations() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    store.create_generation("v0", &[]).unwrap();
    store.create_generation("legacy", &[]).unwrap();

    let mut worker = worker("v1", &store, &network);
    worker.install().await.unwrap();
    let mut deleted = worker.activate().await.unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["legacy".to_string(), "v0".to_string()]);
    assert_eq!(store.names().unwrap(), vec!["v1".to_string()]);
    assert!(worker.is_active());
  }

  #[tokio::test]
  async fn test_activate_requires_installed() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut worker = worker("v1", &store, &network());
    let err = worker.activate().await.unwrap_err();
    assert!(matches!(err, WorkerError::InvalidState { operation: "activate", .. }));
  }

  #[tokio::test]
  async fn test_skip_waiting_during_install_is_remembered() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut worker = worker("v1", &store, &network());

    assert!(!worker.receive(ControlMessage::SkipWaiting));
    assert!(worker.skip_waiting_requested());

    worker.install().await.unwrap();
    assert!(worker.receive(ControlMessage::SkipWaiting));
  }

  #[tokio::test]
  async fn test_inactive_worker_does_not_read_generation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    let mut worker = worker("v1", &store, &network);
    worker.install().await.unwrap();

    let served = worker.handle(Request::get(url("/"))).await;
    assert_eq!(served.source, ServeSource::Passthrough);

    worker.activate().await.unwrap();
    let served = worker.handle(Request::get(url("/"))).await;
    assert_eq!(served.source, ServeSource::Cache);
  }

  #[tokio::test]
  async fn test_cache_hit_makes_no_network_call() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    let mut worker = worker("v1", &store, &network);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let calls = network.calls();
    let stored = store
      .get("v1", &RequestKey::new("GET", &url("/icon")))
      .unwrap()
      .unwrap();
    let served = worker.handle(Request::get(url("/icon"))).await;

    assert_eq!(network.calls(), calls);
    assert_eq!(served.response, stored.to_response());
  }

  #[tokio::test]
  async fn test_excluded_paths_bypass_cache() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    network.route(url("/api/items").as_str(), "[1]");
    let mut worker = worker("v1", &store, &network);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let served = worker.handle(Request::get(url("/api/items"))).await;
    assert_eq!(served.source, ServeSource::Passthrough);
    assert!(store
      .get("v1", &RequestKey::new("GET", &url("/api/items")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_offline_scenarios() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let network = network();
    let mut worker = worker("v1", &store, &network);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    network.set_offline(true);

    let page = worker.handle(Request::navigate(url("/reports/42"))).await;
    assert_eq!(page.source, ServeSource::OfflineFallback);
    assert_eq!(page.response.body, b"<h1>offline</h1>");

    let data = worker.handle(Request::get(url("/data.json"))).await;
    assert_eq!(data.source, ServeSource::Unavailable);
    assert_eq!(data.response.status, 503);
  }
}
