//! Retrieval policies applied to intercepted requests.
//!
//! Policies read and write entries only within the generations they are
//! handed through [`PolicyContext`]; generation lifecycle belongs to the
//! worker.

mod cache_first;
mod network_first;

use color_eyre::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheHandle, CacheStore, CachedEntry};
use crate::classify::AssetClass;
use crate::http::{CacheKey, Request, Response};
use crate::network::Network;

pub use cache_first::CacheFirst;
pub use network_first::NetworkFirst;

/// A strategy for answering a request from network and cache.
pub trait FetchPolicy: Send + Sync {
  fn name(&self) -> &'static str;

  fn fetch_with_policy<'a>(
    &'a self,
    ctx: &'a PolicyContext,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response>>;
}

/// Everything a policy may touch while handling one request.
pub struct PolicyContext {
  pub store: Arc<dyn CacheStore>,
  pub network: Arc<dyn Network>,
  pub static_cache: CacheHandle,
  pub dynamic_cache: CacheHandle,
  /// Skip dynamic writes for bodies larger than this
  pub max_entry_bytes: Option<u64>,
}

impl PolicyContext {
  /// Look up `key` in one generation. Storage failures count as a miss.
  pub async fn lookup(&self, handle: &CacheHandle, key: &CacheKey) -> Option<CachedEntry> {
    match self.store.get(handle, key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(generation = handle.name(), url = %key.url, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Write-through into the dynamic generation. Failures are logged, never raised.
  pub async fn store_dynamic(&self, key: &CacheKey, response: &Response) {
    if let Some(limit) = self.max_entry_bytes {
      if response.body.len() as u64 > limit {
        debug!(url = %key.url, size = response.body.len(), limit, "Skipping oversized dynamic entry");
        return;
      }
    }

    if let Err(e) = self.store.put(&self.dynamic_cache, key, response).await {
      warn!(
        generation = self.dynamic_cache.name(),
        url = %key.url,
        error = %e,
        "Cache write failed"
      );
    }
  }
}

/// Single lookup from classification to policy.
pub struct PolicyTable {
  policies: HashMap<AssetClass, Box<dyn FetchPolicy>>,
}

impl PolicyTable {
  pub fn new() -> Self {
    Self {
      policies: HashMap::new(),
    }
  }

  pub fn with(mut self, class: AssetClass, policy: impl FetchPolicy + 'static) -> Self {
    self.policies.insert(class, Box::new(policy));
    self
  }

  pub fn get(&self, class: AssetClass) -> Option<&dyn FetchPolicy> {
    self.policies.get(&class).map(|p| p.as_ref())
  }
}

impl Default for PolicyTable {
  /// Cache-first for the app shell, network-first for everything else.
  fn default() -> Self {
    Self::new()
      .with(AssetClass::Static, CacheFirst)
      .with(AssetClass::Dynamic, NetworkFirst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{policy_context_with, FailingStore, FakeNetwork};

  fn items() -> Request {
    Request::parse_get("https://example.com/api/items").unwrap()
  }

  #[test]
  fn test_default_table_maps_classes() {
    let table = PolicyTable::default();
    assert_eq!(table.get(AssetClass::Static).unwrap().name(), "cache-first");
    assert_eq!(table.get(AssetClass::Dynamic).unwrap().name(), "network-first");
  }

  #[test]
  fn test_empty_table_has_no_policy() {
    assert!(PolicyTable::new().get(AssetClass::Static).is_none());
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_returns_response() {
    let network = Arc::new(FakeNetwork::new());
    network.route_ok("https://example.com/api/items", "[1]");
    let store = Arc::new(FailingStore::new());
    let ctx = policy_context_with(store.clone(), network).await;
    store.fail_writes();

    for policy in [&CacheFirst as &dyn FetchPolicy, &NetworkFirst] {
      let response = policy.fetch_with_policy(&ctx, &items()).await.unwrap();
      assert_eq!(response.body_text(), "[1]", "{}", policy.name());
    }
    assert!(ctx
      .store
      .get(&ctx.dynamic_cache, &items().cache_key())
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_failed_cache_read_falls_through_to_network() {
    let network = Arc::new(FakeNetwork::new());
    network.route_ok("https://example.com/api/items", "[1]");
    let store = Arc::new(FailingStore::new());
    let ctx = policy_context_with(store.clone(), network.clone()).await;
    ctx
      .store
      .put(&ctx.static_cache, &items().cache_key(), &Response::new(200, "OK", "[]"))
      .await
      .unwrap();
    store.fail_reads();

    let response = CacheFirst.fetch_with_policy(&ctx, &items()).await.unwrap();
    assert_eq!(response.body_text(), "[1]");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_failed_cache_read_while_offline_is_offline() {
    let network = Arc::new(FakeNetwork::new());
    network.route_ok("https://example.com/api/items", "[1]");
    let store = Arc::new(FailingStore::new());
    let ctx = policy_context_with(store.clone(), network.clone()).await;

    NetworkFirst.fetch_with_policy(&ctx, &items()).await.unwrap();
    store.fail_reads();
    network.set_offline(true);

    let response = NetworkFirst.fetch_with_policy(&ctx, &items()).await.unwrap();
    assert_eq!(response, Response::offline());
    let response = CacheFirst.fetch_with_policy(&ctx, &items()).await.unwrap();
    assert_eq!(response, Response::offline());
  }
}
