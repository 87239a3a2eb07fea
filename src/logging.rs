use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// Filter comes from SHELLCACHE_LOG, then RUST_LOG, defaulting to `info`.
/// Logs go to stderr, and to a daily-rolling file when a directory is set.
/// Keep the returned guard alive so buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("SHELLCACHE_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file_layer, guard) = match &config.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "shellcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
