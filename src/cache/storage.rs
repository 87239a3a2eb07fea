//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::http::{CacheKey, Response};

/// Handle to an opened cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
  name: String,
}

impl CacheHandle {
  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A stored response together with its insertion time.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Named, persistent request-key to response mapping.
///
/// `put` overwrites any existing entry for the same key. Concurrent writes to
/// the same key resolve last-write-wins.
pub trait CacheStore: Send + Sync {
  /// Open a generation by name, creating it if it does not exist.
  fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<CacheHandle>>;

  fn get<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
  ) -> BoxFuture<'a, Result<Option<CachedEntry>>>;

  /// Store one entry. A write into a generation that has since been deleted
  /// is dropped; only `open` and `put_all` create generations.
  fn put<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
    response: &'a Response,
  ) -> BoxFuture<'a, Result<()>>;

  /// Open `name` and store every entry, all or nothing.
  fn put_all<'a>(
    &'a self,
    name: &'a str,
    entries: &'a [(CacheKey, Response)],
  ) -> BoxFuture<'a, Result<CacheHandle>>;

  /// Delete a generation and everything in it. Returns whether it existed.
  fn delete_generation<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

  fn list_generation_names(&self) -> BoxFuture<'_, Result<BTreeSet<String>>>;

  fn generation_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

  /// Drop entries older than `max_age`, then evict oldest entries until the
  /// generation's body bytes fit in `max_bytes`. Returns the number removed.
  fn trim_generation<'a>(
    &'a self,
    handle: &'a CacheHandle,
    max_age: Option<Duration>,
    max_bytes: Option<u64>,
  ) -> BoxFuture<'a, Result<usize>>;
}

/// SQLite-based cache storage implementation.
///
/// Every query runs on the blocking thread pool.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn connect(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run `op` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      op(&mut conn)
    })
    .await
    .map_err(|e| eyre!("Cache task failed: {}", e))?
  }
}

fn create_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, datetime('now'))",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open generation {}: {}", name, e))?;
  Ok(())
}

fn generation_exists(conn: &Connection, name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up generation {}: {}", name, e))?;

  Ok(found.is_some())
}

fn get_entry(conn: &Connection, name: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
  let row: Option<(u16, String, String, Vec<u8>, String)> = conn
    .query_row(
      "SELECT status, status_text, headers, body, cached_at FROM entries
       WHERE generation = ? AND key_hash = ?",
      params![name, key.digest()],
      |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      },
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up {} in {}: {}", key.url, name, e))?;

  match row {
    Some((status, status_text, headers, body, cached_at)) => {
      let headers = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key.url, e))?;
      Ok(Some(CachedEntry {
        response: Response {
          status,
          status_text,
          headers,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      }))
    }
    None => Ok(None),
  }
}

fn insert_entry(conn: &Connection, name: &str, key: &CacheKey, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (generation, key_hash, method, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.digest(),
        key.method,
        key.url,
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url, name, e))?;

  Ok(())
}

fn put_entry(conn: &Connection, name: &str, key: &CacheKey, response: &Response) -> Result<()> {
  if !generation_exists(conn, name)? {
    warn!(generation = name, url = %key.url, "Dropping write into deleted generation");
    return Ok(());
  }
  insert_entry(conn, name, key, response)
}

fn put_all(conn: &mut Connection, name: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  create_generation(&tx, name)?;
  for (key, response) in entries {
    insert_entry(&tx, name, key, response)?;
  }

  tx.commit()
    .map_err(|e| eyre!("Failed to commit transaction: {}", e))
}

fn delete_generation(conn: &mut Connection, name: &str) -> Result<bool> {
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
  let removed = tx
    .execute("DELETE FROM generations WHERE name = ?", params![name])
    .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

  tx.commit()
    .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

  Ok(removed > 0)
}

fn list_generation_names(conn: &Connection) -> Result<BTreeSet<String>> {
  let mut stmt = conn
    .prepare("SELECT name FROM generations")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let names = stmt
    .query_map([], |row| row.get::<_, String>(0))
    .map_err(|e| eyre!("Failed to list generations: {}", e))?
    .collect::<rusqlite::Result<BTreeSet<String>>>()
    .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

  Ok(names)
}

fn trim_generation(
  conn: &mut Connection,
  name: &str,
  max_age: Option<Duration>,
  max_bytes: Option<u64>,
) -> Result<usize> {
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
  let mut removed = 0;

  // A cutoff before the representable range expires nothing
  if let Some(cutoff) = max_age.and_then(|age| Utc::now().checked_sub_signed(age)) {
    let cutoff = cutoff.format("%Y-%m-%d %H:%M:%S").to_string();
    removed += tx
      .execute(
        "DELETE FROM entries WHERE generation = ? AND cached_at < ?",
        params![name, cutoff],
      )
      .map_err(|e| eyre!("Failed to expire entries of {}: {}", name, e))?;
  }

  if let Some(max_bytes) = max_bytes {
    // Oldest first; rowid breaks ties between entries written in the same second
    let sizes: Vec<(String, i64)> = {
      let mut stmt = tx
        .prepare(
          "SELECT key_hash, length(body) FROM entries
           WHERE generation = ?
           ORDER BY cached_at ASC, rowid ASC",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map(params![name], |row| {
          Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| eyre!("Failed to measure {}: {}", name, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read entry size: {}", e))?;
      rows
    };

    let mut total: u64 = sizes.iter().map(|(_, len)| *len as u64).sum();
    for (key_hash, len) in sizes {
      if total <= max_bytes {
        break;
      }
      tx.execute(
        "DELETE FROM entries WHERE generation = ? AND key_hash = ?",
        params![name, key_hash],
      )
      .map_err(|e| eyre!("Failed to evict entry from {}: {}", name, e))?;
      total -= len as u64;
      removed += 1;
    }
  }

  tx.commit()
    .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

  Ok(removed)
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache generations
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request identity hash within a generation
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_cached_at
    ON entries(generation, cached_at);
"#;

impl CacheStore for SqliteStore {
  fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<CacheHandle>> {
    Box::pin(async move {
      let name = name.to_string();
      self
        .with_conn(move |conn| {
          create_generation(conn, &name)?;
          Ok(CacheHandle { name })
        })
        .await
    })
  }

  fn get<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
  ) -> BoxFuture<'a, Result<Option<CachedEntry>>> {
    Box::pin(async move {
      let name = handle.name.clone();
      let key = key.clone();
      self
        .with_conn(move |conn| get_entry(conn, &name, &key))
        .await
    })
  }

  fn put<'a>(
    &'a self,
    handle: &'a CacheHandle,
    key: &'a CacheKey,
    response: &'a Response,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      let name = handle.name.clone();
      let key = key.clone();
      let response = response.clone();
      self
        .with_conn(move |conn| put_entry(conn, &name, &key, &response))
        .await
    })
  }

  fn put_all<'a>(
    &'a self,
    name: &'a str,
    entries: &'a [(CacheKey, Response)],
  ) -> BoxFuture<'a, Result<CacheHandle>> {
    Box::pin(async move {
      let name = name.to_string();
      let entries = entries.to_vec();
      self
        .with_conn(move |conn| {
          put_all(conn, &name, &entries)?;
          Ok(CacheHandle { name })
        })
        .await
    })
  }

  fn delete_generation<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
      let name = name.to_string();
      self
        .with_conn(move |conn| delete_generation(conn, &name))
        .await
    })
  }

  fn list_generation_names(&self) -> BoxFuture<'_, Result<BTreeSet<String>>> {
    Box::pin(self.with_conn(|conn| list_generation_names(conn)))
  }

  fn generation_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
      let name = name.to_string();
      self
        .with_conn(move |conn| generation_exists(conn, &name))
        .await
    })
  }

  fn trim_generation<'a>(
    &'a self,
    handle: &'a CacheHandle,
    max_age: Option<Duration>,
    max_bytes: Option<u64>,
  ) -> BoxFuture<'a, Result<usize>> {
    Box::pin(async move {
      let name = handle.name.clone();
      self
        .with_conn(move |conn| trim_generation(conn, &name, max_age, max_bytes))
        .await
    })
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
