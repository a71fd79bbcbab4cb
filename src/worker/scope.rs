//! Static classification of which requests the worker may cache.

use url::Url;

use crate::http::Request;

/// Paths that must never be answered from a cache.
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
  "/api/",
  "/admin/",
  "/_next/webpack-hmr",
  "/livereload",
  "/__debug",
];

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Go through the cache-first strategy.
  Cacheable,
  /// Hand to the network untouched.
  Passthrough,
}

/// The worker's caching scope: one origin minus excluded paths.
#[derive(Debug, Clone)]
pub struct Scope {
  origin: Url,
  excluded_prefixes: Vec<String>,
}

impl Scope {
  pub fn new(origin: Url) -> Self {
    Self::with_exclusions(origin, DEFAULT_EXCLUDED_PREFIXES.iter().map(|p| p.to_string()))
  }

  pub fn with_exclusions(origin: Url, excluded: impl IntoIterator<Item = String>) -> Self {
    Self {
      origin,
      excluded_prefixes: excluded.into_iter().collect(),
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn classify(&self, request: &Request) -> Disposition {
    let url = &request.url;

    if !matches!(url.scheme(), "http" | "https") {
      return Disposition::Passthrough;
    }
    if url.origin() != self.origin.origin() {
      return Disposition::Passthrough;
    }
    if request.method != "GET" {
      return Disposition::Passthrough;
    }
    if self
      .excluded_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
    {
      return Disposition::Passthrough;
    }

    Disposition::Cacheable
  }
}
