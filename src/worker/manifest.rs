//! The precache manifest baked into the worker.

use url::Url;

use crate::cache::RequestKey;
use crate::http::Request;

/// Version label of the generation this build installs.
pub const CACHE_VERSION: &str = concat!("offline-cache-v", env!("CARGO_PKG_VERSION"));

/// Resources every generation must hold before it counts as installed.
pub const PRECACHE_RESOURCES: &[&str] = &["/", "/offline", "/manifest.json", "/icon.png"];

/// Document served to navigations when the network is unreachable.
pub const OFFLINE_DOCUMENT: &str = "/offline";

/// A versioned, immutable list of resources to precache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheManifest {
  version: String,
  resources: Vec<String>,
  offline_document: String,
}

impl PrecacheManifest {
  /// The manifest compiled into this build.
  pub fn builtin() -> Self {
    Self::new(CACHE_VERSION, PRECACHE_RESOURCES, OFFLINE_DOCUMENT)
  }

  /// The offline document is always part of the precached set.
  pub fn new(version: &str, resources: &[&str], offline_document: &str) -> Self {
    let mut resources: Vec<String> = resources.iter().map(|r| r.to_string()).collect();
    if !resources.iter().any(|r| r == offline_document) {
      resources.push(offline_document.to_string());
    }

    Self {
      version: version.to_string(),
      resources,
      offline_document: offline_document.to_string(),
    }
  }

  /// Same resources, different generation label.
  pub fn with_version(&self, version: &str) -> Self {
    Self {
      version: version.to_string(),
      ..self.clone()
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn resources(&self) -> &[String] {
    &self.resources
  }

  /// Cache-busting requests for every resource, resolved against `origin`.
  pub fn requests(&self, origin: &Url) -> Result<Vec<Request>, url::ParseError> {
    self
      .resources
      .iter()
      .map(|path| Ok(Request::get(origin.join(path)?).bypass_cache()))
      .collect()
  }

  pub fn offline_key(&self, origin: &Url) -> Result<RequestKey, url::ParseError> {
    Ok(RequestKey::new("GET", &origin.join(&self.offline_document)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::CacheMode;

  #[test]
  fn test_builtin_contains_offline_document() {
    let manifest = PrecacheManifest::builtin();
    assert!(manifest.resources().iter().any(|r| r == OFFLINE_DOCUMENT));
    assert!(manifest.version().starts_with("offline-cache-v"));
  }

  #[test]
  fn test_offline_document_added_when_missing() {
    let manifest = PrecacheManifest::new("v1", &["/"], "/offline");
    assert_eq!(manifest.resources(), &["/".to_string(), "/offline".to_string()]);
  }

  #[test]
  fn test_requests_bypass_cache() {
    let origin = Url::parse("https://app.test/").unwrap();
    let requests = PrecacheManifest::new("v1", &["/", "/icon.png"], "/offline")
      .requests(&origin)
      .unwrap();

    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.cache == CacheMode::Reload));
    assert_eq!(requests[1].url.as_str(), "https://app.test/icon.png");
  }

  #[test]
  fn test_with_version_keeps_resources() {
    let v1 = PrecacheManifest::new("v1", &["/"], "/offline");
    let v2 = v1.with_version("v2");
    assert_eq!(v2.version(), "v2");
    assert_eq!(v2.resources(), v1.resources());
  }
}
