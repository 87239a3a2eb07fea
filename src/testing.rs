//! Test doubles shared by unit tests.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::background::{Notification, Notifier};
use crate::cache::{CacheHandle, CacheStore, CachedEntry, SqliteStore};
use crate::config::Config;
use crate::http::{CacheKey, Request, Response};
use crate::network::Network;
use crate::policy::PolicyContext;

/// Scripted network that counts every fetch.
///
/// Unknown URLs answer 404; `set_offline` and `fail` make fetches error.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: AtomicUsize,
  requests: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn route_ok(&self, url: &str, body: &str) {
    self.route(url, Response::new(200, "OK", body));
  }

  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().insert(url.to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn reset_calls(&self) {
    self.calls.store(0, Ordering::SeqCst);
  }

  /// Every request seen so far, in arrival order.
  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

impl Network for FakeNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.requests.lock().unwrap().push(request.clone());
      let url = request.url.to_string();

      if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
        return Err(eyre!("connection refused: {}", url));
      }

      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(&url)
          .cloned()
          .unwrap_or_else(|| Response::new(404, "Not Found", "")),
      )
    })
  }
}

/// Config for https://example.com with a two-entry manifest.
pub fn test_config(version: &str) -> Config {
  Config::from_yaml(&format!(
    "origin: https://example.com\nversion: {}\nmanifest: [\"/\", \"/app.js\"]\n",
    version
  ))
  .unwrap()
}

/// Policy context over a fresh in-memory store.
pub async fn policy_context(network: Arc<FakeNetwork>) -> PolicyContext {
  policy_context_with(Arc::new(SqliteStore::open_in_memory().unwrap()), network).await
}

/// Policy context over `store`.
pub async fn policy_context_with(
  store: Arc<dyn CacheStore>,
  network: Arc<FakeNetwork>,
) -> PolicyContext {
  let static_cache = store.open("static-cache-v1").await.unwrap();
  let dynamic_cache = store.open("dynamic-cache-v1").await.unwrap();

  PolicyContext {
    store,
    network,
    static_cache,
    dynamic_cache,
    max_entry_bytes: None,
  }
}

/// In-memory store whose reads and writes can be switched to fail.
pub struct FailingStore {
  inner: SqliteStore,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
}

impl FailingStore {
  pub fn new() -> Self {
    Self {
      inner: SqliteStore::open_in_memory().unwrap(),
      fail_reads: AtomicBool::new(false),
      fail_writes: AtomicBool::new(false),
    }
  }

  pub fn fail_reads(&self) {
    self.fail_reads.store(true, Ordering::SeqCst);
  }

  pub fn fail_writes(&self) {
    self.fail_writes.store(true, Ordering::SeqCst);
  }

  fn check(&self, flag: &AtomicBool, what: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
      return Err(eyre!("{} failed: database is locked", what));
    }
    Ok(())
  }
}

impl CacheStore for FailingStore {
  fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<CacheHandle>> {
    self.inner.open(name)
  }

  fn get<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
  ) -> BoxFuture<'a, Result<Option<CachedEntry>>> {
    Box::pin(async move {
      self.check(&self.fail_reads, "read")?;
      self.inner.get(handle, key).await
    })
  }

  fn put<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
    response: &'a Response,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      self.check(&self.fail_writes, "write")?;
      self.inner.put(handle, key, response).await
    })
  }

  fn put_all<'a>(
    &'a self,
    name: &'a str,
    entries: &'a [(CacheKey, Response)],
  ) -> BoxFuture<'a, Result<CacheHandle>> {
    Box::pin(async move {
      self.check(&self.fail_writes, "write")?;
      self.inner.put_all(name, entries).await
    })
  }

  fn delete_generation<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
    self.inner.delete_generation(name)
  }

  fn list_generation_names(&self) -> BoxFuture<'_, Result<BTreeSet<String>>> {
    self.inner.list_generation_names()
  }

  fn generation_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
    self.inner.generation_exists(name)
  }

  fn trim_generation<'a>(
    &'a self,
    handle: &'a CacheHandle,
    max_age: Option<Duration>,
    max_bytes: Option<u64>,
  ) -> BoxFuture<'a, Result<usize>> {
    self.inner.trim_generation(handle, max_age, max_bytes)
  }
}

/// Notifier that records what it was asked to do.
#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<Notification>>,
  opened: Mutex<Vec<String>>,
}

impl RecordingNotifier {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<String> {
    self.opened.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.to_string());
    Ok(())
  }
}
