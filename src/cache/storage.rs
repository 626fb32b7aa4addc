//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::http::cache::RequestKey;
use crate::http::types::Response;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Human readable request identity, e.g. `GET http://host/data`
  pub description: String,
  /// The stored response snapshot
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores; each store maps request
/// keys to responses.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist.
  fn open(&self, name: &str) -> Result<()>;

  /// Names of all existing stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up one entry. A missing store is a miss, not an error.
  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Insert or replace one entry, creating the store if needed.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// All entries of a store, oldest first.
  fn entries(&self, name: &str) -> Result<Vec<CachedResponse>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
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

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tracker-agent").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named cache store
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request hash within a store
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_description TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);
"#;

type EntryRow = (String, u16, String, Vec<u8>, String);

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_cached_response(row: EntryRow) -> Result<CachedResponse> {
  let (description, status, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", description, e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
    description,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        "SELECT request_description, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
        params![name, key.cache_hash()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", key.description(), name, e))?;

    row.map(into_cached_response).transpose()
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_hash, request_description, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.description(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", key.description(), name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<CachedResponse>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT request_description, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ?
         ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![name], read_entry_row)
      .map_err(|e| eyre!("Failed to query entries of cache {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<EntryRow>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows.into_iter().map(into_cached_response).collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
