//! Core types for the generation cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

use crate::http::{Request, Response, ResponseKind};

/// Identity of a request inside a generation: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url,
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// SHA256 of the description, for stable fixed-length keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable form, e.g. `GET https://app.test/offline`.
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// A response as persisted in a generation store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn from_response(response: &Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      status: response.status,
      status_text: response.status_text.clone(),
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at,
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      kind: ResponseKind::Basic,
    }
  }
}

/// Result of handling a request, including where the answer came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: ServeSource,
  /// When the response was stored (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_cache(stored: StoredResponse) -> Self {
    Self {
      response: stored.to_response(),
      source: ServeSource::Cache,
      cached_at: Some(stored.stored_at),
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Network,
      cached_at: None,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Passthrough,
      cached_at: None,
    }
  }

  pub fn offline_document(stored: StoredResponse) -> Self {
    Self {
      response: stored.to_response(),
      source: ServeSource::OfflineFallback,
      cached_at: Some(stored.stored_at),
    }
  }

  pub fn unavailable() -> Self {
    Self {
      response: Response::service_unavailable(),
      source: ServeSource::Unavailable,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Stored copy in the active generation
  Cache,
  /// Fresh network response (possibly also stored)
  Network,
  /// Out-of-scope request sent straight to the network
  Passthrough,
  /// Network failed on a document request; cached offline page served
  OfflineFallback,
  /// Network failed and nothing suitable was cached
  Unavailable,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::new("get", &Url::parse("https://app.test/page#top").unwrap());
    let b = RequestKey::new("GET", &Url::parse("https://app.test/page").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.description(), "GET https://app.test/page");
  }

  #[test]
  fn test_key_distinguishes_method_and_query() {
    let url = Url::parse("https://app.test/data?page=1").unwrap();
    let other = Url::parse("https://app.test/data?page=2").unwrap();
    assert_ne!(
      RequestKey::new("GET", &url).cache_hash(),
      RequestKey::new("HEAD", &url).cache_hash()
    );
    assert_ne!(
      RequestKey::new("GET", &url).cache_hash(),
      RequestKey::new("GET", &other).cache_hash()
    );
  }

  #[test]
  fn test_hash_is_fixed_length_hex() {
    let key = RequestKey::new("GET", &Url::parse("https://app.test/").unwrap());
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
