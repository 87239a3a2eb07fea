use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::GenerationNames;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the worker serves, e.g. "https://portfolio.example.com"
  pub origin: Url,
  /// Deploy version token appended to generation names
  #[serde(default = "default_version")]
  pub version: String,
  /// Supersede an already-active version as soon as install succeeds
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// App-shell paths precached on install, in order
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub notification: NotificationConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_static_prefix")]
  pub static_prefix: String,
  #[serde(default = "default_dynamic_prefix")]
  pub dynamic_prefix: String,
  /// SQLite database path (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  /// Dynamic entries older than this are pruned on activation
  #[serde(default = "default_dynamic_max_age_days")]
  pub dynamic_max_age_days: Option<i64>,
  /// Total body bytes the dynamic generation may hold
  #[serde(default = "default_dynamic_max_bytes")]
  pub dynamic_max_bytes: Option<u64>,
  /// Responses with larger bodies are not written to the dynamic generation
  pub dynamic_max_entry_bytes: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_prefix: default_static_prefix(),
      dynamic_prefix: default_dynamic_prefix(),
      database: None,
      dynamic_max_age_days: default_dynamic_max_age_days(),
      dynamic_max_bytes: default_dynamic_max_bytes(),
      dynamic_max_entry_bytes: None,
    }
  }
}

impl CacheConfig {
  /// `None` when unset or out of range; `validate` rejects the latter.
  pub fn dynamic_max_age(&self) -> Option<Duration> {
    self.dynamic_max_age_days.and_then(Duration::try_days)
  }

  fn validate(&self) -> Result<()> {
    if let Some(days) = self.dynamic_max_age_days {
      if days <= 0 || Duration::try_days(days).is_none() {
        return Err(eyre!(
          "`cache.dynamic_max_age_days` must be a positive number of days, got {}",
          days
        ));
      }
    }
    if self.dynamic_max_bytes == Some(0) {
      return Err(eyre!("`cache.dynamic_max_bytes` must be greater than zero"));
    }
    if self.dynamic_max_entry_bytes == Some(0) {
      return Err(eyre!("`cache.dynamic_max_entry_bytes` must be greater than zero"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_notification_title")]
  pub title: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_icon")]
  pub badge: String,
  #[serde(default = "default_vibrate")]
  pub vibrate: Vec<u32>,
  /// Body shown when a push carries no payload
  #[serde(default = "default_notification_body")]
  pub default_body: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: default_notification_title(),
      icon: default_icon(),
      badge: default_icon(),
      vibrate: default_vibrate(),
      default_body: default_notification_body(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Also write a daily-rolling log file into this directory
  pub directory: Option<PathBuf>,
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_true() -> bool {
  true
}

fn default_manifest() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/css/variables.css",
    "/css/design-system.css",
    "/css/layout.css",
    "/css/components.css",
    "/css/main.css",
    "/js/utils.js",
    "/js/components.js",
    "/js/main.js",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_static_prefix() -> String {
  "static-cache".to_string()
}

fn default_dynamic_prefix() -> String {
  "dynamic-cache".to_string()
}

fn default_dynamic_max_age_days() -> Option<i64> {
  Some(7)
}

fn default_dynamic_max_bytes() -> Option<u64> {
  Some(50 * 1024 * 1024)
}

fn default_notification_title() -> String {
  "Portfolio Update".to_string()
}

fn default_icon() -> String {
  "/favicon.ico".to_string()
}

fn default_vibrate() -> Vec<u32> {
  vec![100, 50, 100]
}

fn default_notification_body() -> String {
  "New notification".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }
    if self.cache.static_prefix == self.cache.dynamic_prefix {
      return Err(eyre!(
        "Static and dynamic cache prefixes must differ (both are '{}')",
        self.cache.static_prefix
      ));
    }
    if let Some(path) = self.manifest.iter().find(|p| p.is_empty()) {
      return Err(eyre!("Manifest contains an empty path: {:?}", path));
    }
    self.cache.validate()
  }

  /// Current generation names for the configured version.
  pub fn generation_names(&self) -> GenerationNames {
    GenerationNames::new(
      &self.cache.static_prefix,
      &self.cache.dynamic_prefix,
      &self.version,
    )
  }
}
