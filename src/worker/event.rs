//! Events delivered to a worker and the handle used to send them.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::lifecycle::LifecycleState;
use crate::background::Notification;
use crate::http::{Request, Response};

/// Completion signal that keeps an event alive until its work finishes.
pub type Done<T> = Option<oneshot::Sender<T>>;

/// Events the host delivers to a worker's dispatch loop.
#[derive(Debug)]
pub enum WorkerEvent {
  Install {
    done: Done<Result<()>>,
  },
  Activate {
    done: Done<Result<()>>,
  },
  /// Jump straight to active when this version's static generation exists
  Resume {
    done: Done<Result<bool>>,
  },
  SkipWaiting,
  /// `None` on the reply means the request was passed through untouched
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Option<Response>>,
  },
  Sync {
    tag: String,
    done: Done<bool>,
  },
  Push {
    payload: Option<Vec<u8>>,
    done: Done<Option<Notification>>,
  },
  NotificationClick {
    notification: Notification,
    done: Done<()>,
  },
  /// Superseded by a newer version
  Retire,
}

/// Resolve a completion signal. The waiter may already be gone.
pub(crate) fn complete<T>(done: Done<T>, value: T) {
  if let Some(tx) = done {
    let _ = tx.send(value);
  }
}

/// Host-side handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
  version: String,
  tx: mpsc::UnboundedSender<WorkerEvent>,
  state: watch::Receiver<LifecycleState>,
  skip_waiting: Arc<AtomicBool>,
}

impl WorkerHandle {
  pub(crate) fn new(
    version: String,
    tx: mpsc::UnboundedSender<WorkerEvent>,
    state: watch::Receiver<LifecycleState>,
    skip_waiting: Arc<AtomicBool>,
  ) -> Self {
    Self {
      version,
      tx,
      state,
      skip_waiting,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  /// Whether the worker asked to supersede the active version immediately.
  pub fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub(crate) fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker {} is no longer running", self.version))
  }

  async fn request<T>(&self, event: impl FnOnce(Done<T>) -> WorkerEvent) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    self.send(event(Some(tx)))?;
    rx.await
      .map_err(|_| eyre!("Worker {} dropped the event", self.version))
  }

  pub async fn install(&self) -> Result<()> {
    self.request(|done| WorkerEvent::Install { done }).await?
  }

  pub async fn activate(&self) -> Result<()> {
    self.request(|done| WorkerEvent::Activate { done }).await?
  }

  pub async fn resume(&self) -> Result<bool> {
    self.request(|done| WorkerEvent::Resume { done }).await?
  }

  pub fn skip_waiting(&self) -> Result<()> {
    self.send(WorkerEvent::SkipWaiting)
  }

  pub async fn fetch(&self, request: Request) -> Result<Option<Response>> {
    let (respond_to, rx) = oneshot::channel();
    self.send(WorkerEvent::Fetch {
      request,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Worker {} dropped the fetch", self.version))
  }

  pub async fn sync(&self, tag: &str) -> Result<bool> {
    let tag = tag.to_string();
    self.request(|done| WorkerEvent::Sync { tag, done }).await
  }

  pub async fn push(&self, payload: Option<Vec<u8>>) -> Result<Option<Notification>> {
    self
      .request(|done| WorkerEvent::Push { payload, done })
      .await
  }

  pub async fn click(&self, notification: Notification) -> Result<()> {
    self
      .request(|done| WorkerEvent::NotificationClick { notification, done })
      .await
  }

  pub fn retire(&self) -> Result<()> {
    self.send(WorkerEvent::Retire)
  }

  /// Wait until the worker reaches `target` or becomes redundant.
  #[cfg(test)]
  pub async fn wait_for(&mut self, target: LifecycleState) -> LifecycleState {
    let reached = self
      .state
      .wait_for(|state| *state == target || state.is_terminal())
      .await
      .map(|state| *state);

    // Worker gone: report its last known state
    reached.unwrap_or_else(|_| *self.state.borrow())
  }
}
