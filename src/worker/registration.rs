//! Host-side bookkeeping of which worker version controls fetches.

use color_eyre::{eyre::WrapErr, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::controller::Worker;
use super::event::WorkerHandle;
use super::lifecycle::LifecycleState;
use crate::http::{Request, Response};
use crate::network::Network;

/// Tracks the active and waiting worker versions for one origin.
///
/// A new version installs while the active one keeps serving. It takes over
/// once it asks to skip waiting, or immediately when nothing is active.
pub struct Registration {
  network: Arc<dyn Network>,
  active: Option<WorkerHandle>,
  waiting: Option<WorkerHandle>,
}

impl Registration {
  pub fn new(network: Arc<dyn Network>) -> Self {
    Self {
      network,
      active: None,
      waiting: None,
    }
  }

  pub fn active(&self) -> Option<&WorkerHandle> {
    self.active.as_ref()
  }

  #[cfg(test)]
  pub fn waiting(&self) -> Option<&WorkerHandle> {
    self.waiting.as_ref()
  }

  /// Install `worker` and promote it if possible. A failed install leaves the
  /// currently active version untouched.
  pub async fn register(&mut self, worker: Worker) -> Result<LifecycleState> {
    let handle = worker.spawn();
    handle
      .install()
      .await
      .wrap_err_with(|| format!("Install of version {} failed", handle.version()))?;

    if let Some(previous) = self.waiting.replace(handle.clone()) {
      let _ = previous.retire();
    }

    if self.active.is_none() || handle.wants_skip_waiting() {
      self.promote().await?;
    } else {
      info!(version = handle.version(), "Installed, waiting for active version to be released");
    }

    Ok(handle.state())
  }

  /// Take over with an already-deployed version whose static generation
  /// exists. Returns `false` when it has to be installed instead.
  pub async fn resume(&mut self, worker: Worker) -> Result<bool> {
    let handle = worker.spawn();
    if !handle.resume().await? {
      return Ok(false);
    }

    self.replace_active(handle);
    Ok(true)
  }

  /// Promote the waiting version, if any. Returns whether one was promoted.
  pub async fn skip_waiting(&mut self) -> Result<bool> {
    match &self.waiting {
      Some(waiting) => {
        waiting.skip_waiting()?;
        self.promote().await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn promote(&mut self) -> Result<()> {
    let Some(handle) = self.waiting.take() else {
      return Ok(());
    };

    handle
      .activate()
      .await
      .wrap_err_with(|| format!("Activation of version {} failed", handle.version()))?;
    self.replace_active(handle);
    Ok(())
  }

  fn replace_active(&mut self, handle: WorkerHandle) {
    info!(version = handle.version(), "Claimed clients");
    if let Some(previous) = self.active.replace(handle) {
      if let Err(e) = previous.retire() {
        warn!(version = previous.version(), error = %e, "Failed to retire previous version");
      }
    }
  }

  /// Deliver a request to the controlling worker, fetching directly from the
  /// network when there is none or it passes the request through.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    if let Some(active) = &self.active {
      if let Some(response) = active.fetch(request.clone()).await? {
        return Ok(response);
      }
    }

    self.network.fetch(&request).await
  }
}
