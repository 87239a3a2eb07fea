//! Push payloads turned into user-visible notifications.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use url::Url;

use crate::config::NotificationConfig;

/// A notification as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
  pub date_of_arrival: DateTime<Utc>,
  pub primary_key: u32,
}

/// Host surface that displays notifications and opens pages.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;

  fn open_window(&self, url: &Url) -> Result<()>;
}

/// Prints notifications as JSON lines on stdout.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    let json = serde_json::to_string(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    println!("{}", json);
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    println!("open {}", url);
    Ok(())
  }
}

/// Builds notifications from push payloads and handles clicks.
#[derive(Clone)]
pub struct PushHandler {
  config: NotificationConfig,
  root: Url,
  notifier: Arc<dyn Notifier>,
}

impl PushHandler {
  pub fn new(config: NotificationConfig, origin: &Url, notifier: Arc<dyn Notifier>) -> Result<Self> {
    let root = origin
      .join("/")
      .map_err(|e| eyre!("Failed to resolve root page of {}: {}", origin, e))?;

    Ok(Self {
      config,
      root,
      notifier,
    })
  }

  /// The payload only supplies the body; everything else is fixed.
  pub fn notification_for(&self, payload: Option<&[u8]>) -> Notification {
    let body = match payload {
      Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
      None => self.config.default_body.clone(),
    };

    Notification {
      title: self.config.title.clone(),
      body,
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: self.config.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: Utc::now(),
        primary_key: 1,
      },
    }
  }

  pub fn handle_push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    let notification = self.notification_for(payload);
    self.notifier.show(&notification)?;
    Ok(notification)
  }

  /// Clicking any notification focuses or opens the application root.
  pub fn handle_click(&self, _notification: &Notification) -> Result<()> {
    self.notifier.open_window(&self.root)
  }
}
