//! Request and response snapshots exchanged at the network boundary.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Header list, kept in arrival order and passed through verbatim.
pub type Headers = Vec<(String, String)>;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Headers,
}

impl Request {
  /// Create a GET request for an absolute URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
    }
  }

  /// Parse an absolute URL into a GET request.
  #[cfg(test)]
  pub fn parse_get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  /// GET request for `target`, resolved against `base` unless already absolute.
  pub fn resolve_get(base: &Url, target: &str) -> Result<Self> {
    let url = base
      .join(target)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", target, e))?;
    Ok(Self::get(url))
  }

  #[cfg(test)]
  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Normalized identity of this request for cache lookups.
  pub fn cache_key(&self) -> CacheKey {
    let mut url = self.url.clone();
    url.set_fragment(None);
    CacheKey {
      method: self.method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }
}

/// Normalized request identity: uppercase method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub method: String,
  pub url: String,
}

impl CacheKey {
  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A captured response: replayed verbatim on cache hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// The synthesized response returned when neither network nor cache can answer.
  pub fn offline() -> Self {
    Self::new(503, "Service Unavailable", "Offline")
  }

  /// 2xx statuses only.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
