//! Request classification against the static asset manifest.

use url::Url;

use crate::http::Request;

/// Which retrieval policy a request is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
  /// Part of the precached app shell
  Static,
  /// Everything else on the same origin
  Dynamic,
}

/// Ordered, de-duplicated set of app-shell paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
  paths: Vec<String>,
}

impl Manifest {
  pub fn new<I, S>(paths: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut manifest = Self::default();
    for path in paths {
      let path = path.into();
      if !manifest.paths.contains(&path) {
        manifest.paths.push(path);
      }
    }
    manifest
  }

  pub fn paths(&self) -> &[String] {
    &self.paths
  }

  /// Resolve every entry to an absolute URL on `origin`.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>, url::ParseError> {
    self.paths.iter().map(|path| origin.join(path)).collect()
  }
}

/// Decides whether an intercepted request is static or dynamic.
#[derive(Debug, Clone)]
pub struct AssetClassifier {
  origin: Url,
  /// Manifest entries reduced to their path component
  patterns: Vec<String>,
}

impl AssetClassifier {
  pub fn new(origin: Url, manifest: &Manifest) -> Self {
    let patterns = manifest
      .paths()
      .iter()
      .map(|entry| match Url::parse(entry) {
        // Absolute registrations match on their path
        Ok(url) => url.path().to_string(),
        Err(_) => entry.clone(),
      })
      .collect();

    Self { origin, patterns }
  }

  /// Classify a request, or `None` when it must pass through untouched
  /// (non-GET or cross-origin).
  pub fn intercept(&self, request: &Request) -> Option<AssetClass> {
    if !request.is_get() || request.url.origin() != self.origin.origin() {
      return None;
    }
    Some(self.classify(&request.url))
  }

  /// Static iff the path equals, or ends with, a manifest entry.
  pub fn classify(&self, url: &Url) -> AssetClass {
    let path = url.path();
    let is_static = self
      .patterns
      .iter()
      .any(|pattern| path == pattern || path.ends_with(pattern.as_str()));

    if is_static {
      AssetClass::Static
    } else {
      AssetClass::Dynamic
    }
  }
}
