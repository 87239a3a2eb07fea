//! The worker: precaching, stale-generation eviction and fetch dispatch.

use chrono::Duration;
use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use super::event::{complete, WorkerEvent, WorkerHandle};
use super::lifecycle::LifecycleState;
use crate::background::{Notifier, PushHandler, SyncRegistry};
use crate::cache::{CacheStore, GenerationNames};
use crate::classify::{AssetClassifier, Manifest};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::policy::{PolicyContext, PolicyTable};

/// Everything one worker version owns, passed explicitly to every handler.
pub struct WorkerContext {
  pub version: String,
  pub origin: Url,
  pub generations: GenerationNames,
  pub manifest: Manifest,
  pub classifier: AssetClassifier,
  pub store: Arc<dyn CacheStore>,
  pub network: Arc<dyn Network>,
  pub policies: PolicyTable,
  pub sync: SyncRegistry,
  pub push: PushHandler,
  pub skip_waiting: bool,
  pub dynamic_max_age: Option<Duration>,
  pub dynamic_max_bytes: Option<u64>,
  pub dynamic_max_entry_bytes: Option<u64>,
}

impl WorkerContext {
  pub fn from_config(
    config: &Config,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    let manifest = Manifest::new(config.manifest.iter().cloned());
    let classifier = AssetClassifier::new(config.origin.clone(), &manifest);
    let push = PushHandler::new(config.notification.clone(), &config.origin, notifier)?;

    Ok(Self {
      version: config.version.clone(),
      origin: config.origin.clone(),
      generations: config.generation_names(),
      manifest,
      classifier,
      store,
      network,
      policies: PolicyTable::default(),
      sync: SyncRegistry::with_defaults(),
      push,
      skip_waiting: config.skip_waiting,
      dynamic_max_age: config.cache.dynamic_max_age(),
      dynamic_max_bytes: config.cache.dynamic_max_bytes,
      dynamic_max_entry_bytes: config.cache.dynamic_max_entry_bytes,
    })
  }
}

/// One deployed version of the worker.
pub struct Worker {
  ctx: WorkerContext,
  state: watch::Sender<LifecycleState>,
  skip_waiting: Arc<AtomicBool>,
  /// Set once the generations are opened during activation
  policy_ctx: OnceLock<PolicyContext>,
}

impl Worker {
  pub fn new(ctx: WorkerContext) -> Self {
    let (state, _) = watch::channel(LifecycleState::Installing);
    Self {
      ctx,
      state,
      skip_waiting: Arc::new(AtomicBool::new(false)),
      policy_ctx: OnceLock::new(),
    }
  }

  pub fn context(&self) -> &WorkerContext {
    &self.ctx
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  fn advance(&self, next: LifecycleState) -> Result<()> {
    let mut result = Ok(());
    self.state.send_if_modified(|state| {
      if state.can_transition_to(next) {
        *state = next;
        true
      } else {
        result = Err(eyre!(
          "Worker {}: illegal lifecycle transition {} -> {}",
          self.ctx.version,
          state,
          next
        ));
        false
      }
    });

    if result.is_ok() {
      info!(version = %self.ctx.version, state = %next, "Lifecycle transition");
    }
    result
  }

  /// Mark this version redundant. Already-redundant workers stay as they are.
  pub fn retire(&self) {
    if !self.state().is_terminal() {
      let _ = self.advance(LifecycleState::Redundant);
    }
  }

  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Precache every manifest path into the static generation.
  ///
  /// Any failed fetch fails the whole install and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    if self.state() != LifecycleState::Installing {
      return Err(eyre!(
        "Worker {} cannot install from state {}",
        self.ctx.version,
        self.state()
      ));
    }

    info!(version = %self.ctx.version, "Caching static assets");
    match self.precache().await {
      Ok(count) => {
        debug!(count, generation = %self.ctx.generations.static_name, "Precache complete");
        self.advance(LifecycleState::Installed)?;
        if self.ctx.skip_waiting {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        warn!(version = %self.ctx.version, error = %e, "Install failed");
        self.retire();
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let urls = self
      .ctx
      .manifest
      .resolve(&self.ctx.origin)
      .map_err(|e| eyre!("Invalid manifest entry: {}", e))?;
    let requests: Vec<Request> = urls.into_iter().map(Request::get).collect();

    // Fetch everything before writing anything: no partial precache
    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self
        .ctx
        .network
        .fetch(request)
        .await
        .wrap_err_with(|| format!("Failed to precache {}", request.url))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    }))
    .await?;

    // Created and filled in a single transaction
    let entries: Vec<_> = requests
      .iter()
      .map(|request| request.cache_key())
      .zip(responses)
      .collect();
    let name = &self.ctx.generations.static_name;
    self
      .ctx
      .store
      .put_all(name, &entries)
      .await
      .wrap_err_with(|| format!("Failed to store precache into {}", name))?;

    Ok(entries.len())
  }

  /// Evict stale generations, open the current ones and start serving.
  pub async fn activate(&self) -> Result<()> {
    self.advance(LifecycleState::Activating)?;

    match self.open_generations().await {
      Ok(policy_ctx) => {
        self.evict_stale().await;
        self.trim_dynamic(&policy_ctx).await;
        let _ = self.policy_ctx.set(policy_ctx);
        // Claim: from here on every dispatched fetch is handled by this version
        self.advance(LifecycleState::Active)
      }
      Err(e) => {
        warn!(version = %self.ctx.version, error = %e, "Activation failed");
        self.retire();
        Err(e)
      }
    }
  }

  /// Restart an already-deployed version without precaching again.
  ///
  /// Returns `false` (and stays installing) when the static generation is missing.
  pub async fn resume(&self) -> Result<bool> {
    let exists = self
      .ctx
      .store
      .generation_exists(&self.ctx.generations.static_name)
      .await?;
    if !exists {
      return Ok(false);
    }

    info!(version = %self.ctx.version, "Resuming from existing static generation");
    self.advance(LifecycleState::Installed)?;
    self.activate().await?;
    Ok(true)
  }

  async fn open_generations(&self) -> Result<PolicyContext> {
    let static_cache = self.ctx.store.open(&self.ctx.generations.static_name).await?;
    let dynamic_cache = self.ctx.store.open(&self.ctx.generations.dynamic_name).await?;

    Ok(PolicyContext {
      store: Arc::clone(&self.ctx.store),
      network: Arc::clone(&self.ctx.network),
      static_cache,
      dynamic_cache,
      max_entry_bytes: self.ctx.dynamic_max_entry_bytes,
    })
  }

  async fn evict_stale(&self) {
    let names = match self.ctx.store.list_generation_names().await {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list cache generations, skipping eviction");
        return;
      }
    };

    for name in self.ctx.generations.stale(&names) {
      info!(generation = name, "Deleting old cache");
      if let Err(e) = self.ctx.store.delete_generation(name).await {
        warn!(generation = name, error = %e, "Failed to delete old cache");
      }
    }
  }

  async fn trim_dynamic(&self, policy_ctx: &PolicyContext) {
    if self.ctx.dynamic_max_age.is_none() && self.ctx.dynamic_max_bytes.is_none() {
      return;
    }

    match self
      .ctx
      .store
      .trim_generation(
        &policy_ctx.dynamic_cache,
        self.ctx.dynamic_max_age,
        self.ctx.dynamic_max_bytes,
      )
      .await
    {
      Ok(0) => {}
      Ok(removed) => info!(removed, generation = policy_ctx.dynamic_cache.name(), "Pruned dynamic cache"),
      Err(e) => warn!(error = %e, "Failed to prune dynamic cache"),
    }
  }

  /// Answer an intercepted request, or `None` to let it pass through.
  ///
  /// Policy errors become the offline response; an intercepted request is
  /// always answered.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
    if self.state() != LifecycleState::Active {
      return None;
    }
    let class = self.ctx.classifier.intercept(request)?;
    let policy_ctx = self.policy_ctx.get()?;

    let response = match self.ctx.policies.get(class) {
      Some(policy) => match policy.fetch_with_policy(policy_ctx, request).await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = %request.url, policy = policy.name(), error = %e, "Policy failed");
          Response::offline()
        }
      },
      None => {
        warn!(url = %request.url, ?class, "No policy registered");
        Response::offline()
      }
    };

    Some(response)
  }

  /// Start the dispatch loop and return the host's handle to it.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle::new(
      self.ctx.version.clone(),
      tx,
      self.state.subscribe(),
      Arc::clone(&self.skip_waiting),
    );

    tokio::spawn(Arc::new(self).run(rx));
    handle
  }

  /// Consume events until every handle is dropped.
  ///
  /// Each event runs as its own task. A fetch whose requester has gone away
  /// still completes, so its cache write lands.
  async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
      let worker = Arc::clone(&self);
      tokio::spawn(async move { worker.handle_event(event).await });
    }
    debug!(version = %self.ctx.version, "Worker event channel closed");
  }

  async fn handle_event(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install { done } => complete(done, self.install().await),
      WorkerEvent::Activate { done } => complete(done, self.activate().await),
      WorkerEvent::Resume { done } => complete(done, self.resume().await),
      WorkerEvent::SkipWaiting => self.skip_waiting(),
      WorkerEvent::Fetch {
        request,
        respond_to,
      } => {
        let response = self.handle_fetch(&request).await;
        if respond_to.send(response).is_err() {
          debug!(url = %request.url, "Requester went away before the response");
        }
      }
      WorkerEvent::Sync { tag, done } => complete(done, self.ctx.sync.run(&tag).await),
      WorkerEvent::Push { payload, done } => {
        let shown = match self.ctx.push.handle_push(payload.as_deref()) {
          Ok(notification) => Some(notification),
          Err(e) => {
            warn!(error = %e, "Failed to show notification");
            None
          }
        };
        complete(done, shown);
      }
      WorkerEvent::NotificationClick { notification, done } => {
        if let Err(e) = self.ctx.push.handle_click(&notification) {
          warn!(error = %e, "Failed to open window");
        }
        complete(done, ());
      }
      WorkerEvent::Retire => self.retire(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::testing::{test_config, FakeNetwork, RecordingNotifier};

  struct Fixture {
    store: Arc<SqliteStore>,
    network: Arc<FakeNetwork>,
  }

  impl Fixture {
    fn new() -> Self {
      let network = Arc::new(FakeNetwork::new());
      network.route_ok("https://example.com/", "<html></html>");
      network.route_ok("https://example.com/app.js", "console.log('app')");
      Self {
        store: Arc::new(SqliteStore::open_in_memory().unwrap()),
        network,
      }
    }

    fn worker(&self, version: &str) -> Worker {
      let ctx = WorkerContext::from_config(
        &test_config(version),
        self.store.clone(),
        self.network.clone(),
        Arc::new(RecordingNotifier::default()),
      )
      .unwrap();
      Worker::new(ctx)
    }
  }

  fn get(url: &str) -> Request {
    Request::parse_get(url).unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");

    worker.install().await.unwrap();

    assert_eq!(worker.state(), LifecycleState::Installed);
    let handle = fixture.store.open("static-cache-v1").await.unwrap();
    let entry = fixture
      .store
      .get(&handle, &get("https://example.com/app.js").cache_key())
      .await
      .unwrap()
      .unwrap();
    assert!(!entry.response.body.is_empty());
  }

  #[tokio::test]
  async fn test_static_assets_served_without_network_after_install() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    fixture.network.reset_calls();

    for path in ["/", "/app.js"] {
      let response = worker
        .handle_fetch(&get(&format!("https://example.com{}", path)))
        .await
        .unwrap();
      assert_eq!(response.status, 200);
    }
    assert_eq!(fixture.network.calls(), 0);
  }

  #[tokio::test]
  async fn test_failed_precache_fails_install_and_writes_nothing() {
    let fixture = Fixture::new();
    fixture.network.fail("https://example.com/app.js");
    let worker = fixture.worker("v1");

    assert!(worker.install().await.is_err());

    assert_eq!(worker.state(), LifecycleState::Redundant);
    assert!(!fixture
      .store
      .generation_exists("static-cache-v1")
      .await
      .unwrap());
  }

  #[tokio::test]
  async fn test_error_status_fails_install() {
    let fixture = Fixture::new();
    fixture
      .network
      .route("https://example.com/app.js", Response::new(500, "Internal Server Error", ""));
    let worker = fixture.worker("v1");

    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), LifecycleState::Redundant);
  }

  #[tokio::test]
  async fn test_activate_evicts_stale_generations() {
    let fixture = Fixture::new();
    fixture.store.open("static-cache-v0").await.unwrap();
    fixture.store.open("dynamic-cache-v0").await.unwrap();
    let worker = fixture.worker("v1");

    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let names: Vec<String> = fixture
      .store
      .list_generation_names()
      .await
      .unwrap()
      .into_iter()
      .collect();
    assert_eq!(names, vec!["dynamic-cache-v1", "static-cache-v1"]);
    assert_eq!(worker.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");

    assert!(worker.activate().await.is_err());
    assert_eq!(worker.state(), LifecycleState::Installing);
  }

  #[tokio::test]
  async fn test_fetch_before_active_passes_through() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();

    assert!(worker
      .handle_fetch(&get("https://example.com/app.js"))
      .await
      .is_none());
  }

  #[tokio::test]
  async fn test_dynamic_offline_without_cache_is_503() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    fixture.network.fail("https://example.com/data");

    let response = worker
      .handle_fetch(&get("https://example.com/data"))
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.body_text(), "Offline");
  }

  #[tokio::test]
  async fn test_dynamic_falls_back_to_cached_body() {
    let fixture = Fixture::new();
    fixture.network.route_ok("https://example.com/api/items", "[]");
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let first = worker
      .handle_fetch(&get("https://example.com/api/items"))
      .await
      .unwrap();
    assert_eq!(first.body_text(), "[]");

    fixture.network.set_offline(true);
    let second = worker
      .handle_fetch(&get("https://example.com/api/items"))
      .await
      .unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.body_text(), "[]");
  }

  #[tokio::test]
  async fn test_missing_policy_answers_offline() {
    let fixture = Fixture::new();
    let mut ctx = WorkerContext::from_config(
      &test_config("v1"),
      fixture.store.clone(),
      fixture.network.clone(),
      Arc::new(RecordingNotifier::default()),
    )
    .unwrap();
    ctx.policies = PolicyTable::new();
    let worker = Worker::new(ctx);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let response = worker
      .handle_fetch(&get("https://example.com/api/items"))
      .await
      .unwrap();
    assert_eq!(response, Response::offline());
  }

  #[tokio::test]
  async fn test_cross_origin_and_post_pass_through() {
    let fixture = Fixture::new();
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    assert!(worker
      .handle_fetch(&get("https://cdn.example.net/lib.js"))
      .await
      .is_none());
    assert!(worker
      .handle_fetch(&get("https://example.com/api/items").with_method("POST"))
      .await
      .is_none());
  }

  #[tokio::test]
  async fn test_resume_requires_static_generation() {
    let fixture = Fixture::new();
    let fresh = fixture.worker("v1");
    assert!(!fresh.resume().await.unwrap());
    assert_eq!(fresh.state(), LifecycleState::Installing);

    let installed = fixture.worker("v1");
    installed.install().await.unwrap();

    let restarted = fixture.worker("v1");
    fixture.network.reset_calls();
    assert!(restarted.resume().await.unwrap());
    assert_eq!(restarted.state(), LifecycleState::Active);
    assert_eq!(fixture.network.calls(), 0);
  }

  #[tokio::test]
  async fn test_fetch_completes_after_requester_leaves() {
    let fixture = Fixture::new();
    fixture.network.route_ok("https://example.com/api/items", "[]");
    let handle = fixture.worker("v1").spawn();
    handle.install().await.unwrap();
    handle.activate().await.unwrap();

    let (respond_to, rx) = tokio::sync::oneshot::channel();
    drop(rx);
    handle
      .send(WorkerEvent::Fetch {
        request: get("https://example.com/api/items"),
        respond_to,
      })
      .unwrap();

    let dynamic = fixture.store.open("dynamic-cache-v1").await.unwrap();
    let key = get("https://example.com/api/items").cache_key();
    let stored = tokio::time::timeout(std::time::Duration::from_secs(5), async {
      while fixture.store.get(&dynamic, &key).await.unwrap().is_none() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      }
    })
    .await;
    assert!(stored.is_ok(), "fetch task never wrote through");
  }

  #[tokio::test]
  async fn test_request_headers_reach_network() {
    let fixture = Fixture::new();
    fixture.network.route_ok("https://example.com/api/items", "[]");
    let worker = fixture.worker("v1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let request = get("https://example.com/api/items")
      .with_header("accept", "application/json")
      .with_header("x-request-id", "42");
    worker.handle_fetch(&request).await.unwrap();

    let seen = fixture.network.requests();
    let last = seen.last().unwrap();
    assert_eq!(last.url.as_str(), "https://example.com/api/items");
    assert_eq!(
      last.headers,
      vec![
        ("accept".to_string(), "application/json".to_string()),
        ("x-request-id".to_string(), "42".to_string()),
      ]
    );
  }
}
