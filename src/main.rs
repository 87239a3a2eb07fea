mod background;
mod cache;
mod classify;
mod config;
mod http;
mod logging;
mod network;
mod policy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::warn;
use url::Url;

use background::{ConsoleNotifier, Notifier, DEFAULT_SYNC_TAG};
use cache::{CacheStore, SqliteStore};
use config::Config;
use http::{Request, Response};
use network::{HttpNetwork, Network};
use worker::{Registration, Worker, WorkerContext, WorkerHandle};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline app-shell cache with cache-first and network-first dispatch")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(long)]
  origin: Option<Url>,

  /// Deploy version token, overriding the config file
  #[arg(long = "cache-version")]
  cache_version: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and make it active
  Install,
  /// Dispatch requests through the active worker and print the responses
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Dispatch one URL per line read from stdin
  Serve,
  /// List cache generations, marking the current ones
  Generations,
  /// Signal a background sync task
  Sync {
    #[arg(default_value = DEFAULT_SYNC_TAG)]
    tag: String,
  },
  /// Deliver a push payload and show the notification
  Push { payload: Option<String> },
  /// Simulate a click on a notification
  Click,
}

/// Shared pieces every worker version is built from.
struct Host {
  config: Config,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  notifier: Arc<dyn Notifier>,
}

impl Host {
  fn worker(&self) -> Result<Worker> {
    let ctx = WorkerContext::from_config(
      &self.config,
      Arc::clone(&self.store),
      Arc::clone(&self.network),
      Arc::clone(&self.notifier),
    )?;
    Ok(Worker::new(ctx))
  }

  /// Resume the deployed version, installing it first if its caches are missing.
  async fn start(&self) -> Result<Registration> {
    let mut registration = Registration::new(Arc::clone(&self.network));
    if !registration.resume(self.worker()?).await? {
      registration.register(self.worker()?).await?;
    }
    Ok(registration)
  }
}

fn active(registration: &Registration) -> Result<&WorkerHandle> {
  registration
    .active()
    .ok_or_else(|| eyre!("No active worker version"))
}

fn print_response(url: &str, result: Result<Response>, with_body: bool) {
  match result {
    Ok(response) => {
      println!(
        "{} {} {} ({} bytes)",
        url,
        response.status,
        response.status_text,
        response.body.len()
      );
      if with_body {
        println!("{}", response.body_text());
      }
    }
    Err(e) => println!("{} error: {}", url, e),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override origin and version if specified on command line
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.cache_version {
    config.version = version;
  }

  let _log_guard = logging::init(&config.log)?;

  let store = SqliteStore::connect(config.cache.database.as_deref())?;
  let host = Host {
    store: Arc::new(store),
    network: Arc::new(HttpNetwork::new()?),
    notifier: Arc::new(ConsoleNotifier),
    config,
  };

  match args.command {
    Command::Install => {
      let mut registration = Registration::new(Arc::clone(&host.network));
      let state = registration.register(host.worker()?).await?;
      println!("{} {}", host.config.version, state);
    }
    Command::Fetch { urls } => {
      let registration = host.start().await?;
      let results = futures::future::join_all(urls.iter().map(|url| async {
        let request = Request::resolve_get(&host.config.origin, url)?;
        registration.fetch(request).await
      }))
      .await;

      for (url, result) in urls.iter().zip(results) {
        print_response(url, result, true);
      }
    }
    Command::Serve => {
      let registration = Arc::new(host.start().await?);
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      let mut tasks = JoinSet::new();

      while let Some(line) = lines.next_line().await? {
        let url = line.trim().to_string();
        if url.is_empty() {
          continue;
        }
        let request = match Request::resolve_get(&host.config.origin, &url) {
          Ok(request) => request,
          Err(e) => {
            warn!(error = %e, "Skipping line");
            continue;
          }
        };

        let registration = Arc::clone(&registration);
        tasks.spawn(async move {
          print_response(&url, registration.fetch(request).await, false);
        });
      }

      while tasks.join_next().await.is_some() {}
    }
    Command::Generations => {
      let names = host.store.list_generation_names().await?;
      let current = host.config.generation_names();
      for name in names {
        let marker = if current.is_current(&name) { "*" } else { " " };
        println!("{} {}", marker, name);
      }
    }
    Command::Sync { tag } => {
      let registration = host.start().await?;
      let completed = active(&registration)?.sync(&tag).await?;
      println!("{} {}", tag, if completed { "completed" } else { "not completed" });
    }
    Command::Push { payload } => {
      let registration = host.start().await?;
      active(&registration)?
        .push(payload.map(String::into_bytes))
        .await?;
    }
    Command::Click => {
      let worker = host.worker()?;
      let notification = worker.context().push.notification_for(None);
      let registration = host.start().await?;
      active(&registration)?.click(notification).await?;
    }
  }

  Ok(())
}
