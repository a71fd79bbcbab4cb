//! Request/response types crossing the interception boundary, and the
//! network the worker falls back to on a cache miss.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level document load.
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// Whether intermediate HTTP caches may answer the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
  #[default]
  Default,
  /// Always go to the origin server (used for precaching).
  Reload,
}

/// An outbound request issued by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub mode: RequestMode,
  pub cache: CacheMode,
}

impl Request {
  /// A plain sub-resource `GET`.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: BTreeMap::new(),
      mode: RequestMode::SameOrigin,
      cache: CacheMode::Default,
    }
  }

  /// A top-level navigation expecting an HTML document.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
    .with_header("accept", "text/html,application/xhtml+xml")
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  /// Header names are stored lowercase.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Bypass every intermediate cache between us and the origin.
  pub fn bypass_cache(mut self) -> Self {
    self.cache = CacheMode::Reload;
    self
      .with_header("cache-control", "no-cache")
      .with_header("pragma", "no-cache")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// True for navigations and anything whose `Accept` asks for HTML.
  pub fn accepts_html(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .header("accept")
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
  }
}

/// Response tainting, as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
  /// Same-origin response with readable body.
  #[default]
  Basic,
  /// Cross-origin response the page may read.
  Cors,
  /// Cross-origin no-cors response; status and body are hidden.
  Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      headers: BTreeMap::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  /// Synthetic answer for a non-document request that could not be served.
  pub fn service_unavailable() -> Self {
    Self::new(503, "Service Unavailable").with_header("content-type", "text/plain")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// A plain, same-origin `200` is the only thing worth storing.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.kind == ResponseKind::Basic
  }
}

fn reason_phrase(status: u16) -> &'static str {
  match status {
    200 => "OK",
    204 => "No Content",
    301 => "Moved Permanently",
    302 => "Found",
    304 => "Not Modified",
    400 => "Bad Request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not Found",
    500 => "Internal Server Error",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    504 => "Gateway Timeout",
    _ => "",
  }
}

/// Failures reaching the network. Recovered by the worker, never surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Network unreachable: {0}")]
  Unreachable(String),

  #[error("Request timed out")]
  Timeout,

  #[error("Network error: {0}")]
  Other(String),
}

/// The network as seen from inside the worker.
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetworkError>>;
}

/// Network backed by a real HTTP client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| NetworkError::Other(format!("Failed to create HTTP client: {}", e)))?;
    Ok(Self { client, origin })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetworkError>> {
    let client = self.client.clone();
    let origin = self.origin.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| NetworkError::Other(format!("Invalid method {}: {}", request.method, e)))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }

      let response = builder.send().await.map_err(map_reqwest_error)?;

      let kind = if response.url().origin() == origin.origin() {
        ResponseKind::Basic
      } else if request.mode == RequestMode::NoCors {
        ResponseKind::Opaque
      } else {
        ResponseKind::Cors
      };

      let status = response.status();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

      Ok(Response {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        headers,
        body,
        kind,
      })
    })
  }
}

/// A network that can be switched off, the way a device loses connectivity.
#[derive(Clone)]
pub struct SwitchedNetwork {
  inner: Arc<dyn Network>,
  online: Arc<AtomicBool>,
}

impl SwitchedNetwork {
  pub fn new(inner: Arc<dyn Network>) -> Self {
    Self {
      inner,
      online: Arc::new(AtomicBool::new(true)),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

impl Network for SwitchedNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetworkError>> {
    if self.is_online() {
      self.inner.fetch(request)
    } else {
      Box::pin(async { Err(NetworkError::Unreachable("offline".to_string())) })
    }
  }
}

fn map_reqwest_error(e: reqwest::Error) -> NetworkError {
  if e.is_timeout() {
    NetworkError::Timeout
  } else if e.is_connect() {
    NetworkError::Unreachable(e.to_string())
  } else {
    NetworkError::Other(e.to_string())
  }
}

#[cfg(test)]
pub(crate) mod fake {
  //! Scripted network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  #[derive(Clone, Default)]
  pub struct FakeNetwork {
    routes: Arc<Mutex<HashMap<String, Response>>>,
    failing: Arc<Mutex<Vec<String>>>,
    seen: Arc<Mutex<Vec<Request>>>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Serve `body` with status 200 for `url`.
    pub fn route(&self, url: &str, body: &str) -> &Self {
      self.route_response(url, Response::new(200, body))
    }

    pub fn route_response(&self, url: &str, response: Response) -> &Self {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
      self
    }

    /// Make a single URL fail as if unreachable.
    pub fn fail(&self, url: &str) -> &Self {
      self.failing.lock().unwrap().push(url.to_string());
      self
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
      self.seen.lock().unwrap().clone()
    }
  }

  impl Network for FakeNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetworkError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.seen.lock().unwrap().push(request.clone());

      let url = request.url.to_string();
      let result = if self.offline.load(Ordering::SeqCst) {
        Err(NetworkError::Unreachable("offline".to_string()))
      } else if self.failing.lock().unwrap().contains(&url) {
        Err(NetworkError::Unreachable(url.clone()))
      } else {
        Ok(
          self
            .routes
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| Response::new(404, "Not Found")),
        )
      };

      Box::pin(async move { result })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_navigation_accepts_html() {
    assert!(Request::navigate(url("https://app.test/")).accepts_html());
    assert!(!Request::get(url("https://app.test/app.js")).accepts_html());
    assert!(Request::get(url("https://app.test/page"))
      .with_header("Accept", "text/html")
      .accepts_html());
  }

  #[test]
  fn test_bypass_cache_sets_headers() {
    let request = Request::get(url("https://app.test/")).bypass_cache();
    assert_eq!(request.cache, CacheMode::Reload);
    assert_eq!(request.header("Cache-Control"), Some("no-cache"));
  }

  #[test]
  fn test_cacheable_responses() {
    assert!(Response::new(200, "ok").is_cacheable());
    assert!(!Response::new(404, "").is_cacheable());
    assert!(!Response::new(206, "").is_cacheable());
    assert!(!Response::new(200, "")
      .with_kind(ResponseKind::Opaque)
      .is_cacheable());
    assert!(!Response::new(200, "")
      .with_kind(ResponseKind::Cors)
      .is_cacheable());
  }

  #[test]
  fn test_service_unavailable() {
    let response = Response::service_unavailable();
    assert_eq!(response.status, 503);
    assert_eq!(response.status_text, "Service Unavailable");
    assert!(!response.is_success());
  }

  #[tokio::test]
  async fn test_switched_network_goes_offline() {
    let fake = fake::FakeNetwork::new();
    fake.route("https://app.test/", "home");
    let network = SwitchedNetwork::new(Arc::new(fake.clone()));

    assert!(network.fetch(Request::get(url("https://app.test/"))).await.is_ok());

    network.set_online(false);
    let result = network.fetch(Request::get(url("https://app.test/"))).await;
    assert!(matches!(result, Err(NetworkError::Unreachable(_))));
    assert_eq!(fake.calls(), 1);
  }
}
