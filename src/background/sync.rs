//! Deferred background synchronization.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tag the host uses for the default sync task.
pub const DEFAULT_SYNC_TAG: &str = "background-sync";

type SyncTask = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Named background tasks run when the host signals their tag.
///
/// Failures are swallowed; retrying is left to the host.
#[derive(Clone, Default)]
pub struct SyncRegistry {
  tasks: HashMap<String, SyncTask>,
}

impl SyncRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the default `background-sync` task.
  pub fn with_defaults() -> Self {
    Self::new().register(DEFAULT_SYNC_TAG, || async {
      info!("Background sync completed");
      Ok(())
    })
  }

  pub fn register<F, Fut>(mut self, tag: &str, task: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
  {
    self
      .tasks
      .insert(tag.to_string(), Arc::new(move || -> BoxFuture<'static, Result<()>> {
        Box::pin(task())
      }));
    self
  }

  /// Run the task for `tag`. Returns whether a task ran to completion.
  pub async fn run(&self, tag: &str) -> bool {
    let Some(task) = self.tasks.get(tag) else {
      debug!(tag, "No sync task registered");
      return false;
    };

    match task().await {
      Ok(()) => true,
      Err(e) => {
        warn!(tag, error = %e, "Background sync failed, leaving retry to host");
        false
      }
    }
  }
}
