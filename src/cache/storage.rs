//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedEntry;
use crate::net::Response;
use crate::outbox::{ActionStore, NewAction, PendingAction};

/// Trait for cache bucket backends.
pub trait CacheStorage: Send + Sync {
  /// Names of every bucket that currently exists, in creation order.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Create a bucket if it does not exist yet.
  fn open_bucket(&self, bucket: &str) -> Result<()>;

  /// Delete a bucket and all of its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Look up a single entry in one bucket.
  fn get_entry(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store (or overwrite) one entry, creating the bucket if needed.
  fn put_entry(&self, bucket: &str, key: &str, response: &Response) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, bucket: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Keys stored in a bucket.
  fn entry_keys(&self, bucket: &str) -> Result<Vec<String>>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;

  /// Search the given buckets in order and return the first hit.
  fn match_any(&self, buckets: &[&str], key: &str) -> Result<Option<CachedEntry>> {
    for bucket in buckets {
      if let Some(entry) = self.get_entry(bucket, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// SQLite-based storage for cache buckets, the pending-action queue and worker state.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database that lives as long as this value.
  pub fn in_memory() -> Result<Self> {
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

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_key)
);

-- Mutating requests that could not reach the network (FIFO by id)
CREATE TABLE IF NOT EXISTS pending_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    payload TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS worker_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const UPSERT_ENTRY: &str = "INSERT OR REPLACE INTO cache_entries (bucket, request_key, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, datetime('now'))";

const ENSURE_BUCKET: &str = "INSERT OR IGNORE INTO buckets (name) VALUES (?)";

impl CacheStorage for SqliteStorage {
  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn open_bucket(&self, bucket: &str) -> Result<()> {
    self
      .lock()?
      .execute(ENSURE_BUCKET, params![bucket])
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE bucket = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![bucket, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          bucket: bucket.to_string(),
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, bucket: &str, key: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(ENSURE_BUCKET, params![bucket])
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    tx.execute(
      UPSERT_ENTRY,
      params![bucket, key, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, bucket: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(ENSURE_BUCKET, params![bucket])
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
      tx.execute(
        UPSERT_ENTRY,
        params![bucket, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
    }

    // Dropping the transaction without commit rolls every insert back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_keys(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE bucket = ? ORDER BY request_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT value FROM worker_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read worker state {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO worker_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write worker state {}: {}", key, e))?;
    Ok(())
  }
}

impl ActionStore for SqliteStorage {
  fn push_action(&self, action: &NewAction) -> Result<PendingAction> {
    let payload = action
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let id = {
      let conn = self.lock()?;
      conn
        .execute(
          "INSERT INTO pending_actions (kind, method, url, payload) VALUES (?, ?, ?, ?)",
          params![action.kind, action.method, action.url, payload],
        )
        .map_err(|e| eyre!("Failed to queue action: {}", e))?;
      conn.last_insert_rowid()
    };

    self
      .get_action(id)?
      .ok_or_else(|| eyre!("Queued action {} disappeared", id))
  }

  fn get_action(&self, id: i64) -> Result<Option<PendingAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!("{} WHERE id = ?", SELECT_ACTIONS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![id], read_action_row)
      .optional()
      .map_err(|e| eyre!("Failed to read action {}: {}", id, e))?;

    row.map(ActionRow::into_action).transpose()
  }

  fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!("{} ORDER BY id", SELECT_ACTIONS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_action_row)
      .map_err(|e| eyre!("Failed to list actions: {}", e))?
      .collect::<rusqlite::Result<Vec<ActionRow>>>()
      .map_err(|e| eyre!("Failed to read action: {}", e))?;

    rows.into_iter().map(ActionRow::into_action).collect()
  }

  fn remove_action(&self, id: i64) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM pending_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove action {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn record_failure(&self, id: i64, error: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE pending_actions SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record attempt for action {}: {}", id, e))?;
    Ok(())
  }
}

const SELECT_ACTIONS: &str =
  "SELECT id, kind, method, url, payload, attempts, last_error, created_at FROM pending_actions";

/// Raw column values; decoding JSON and timestamps happens outside the row closure.
struct ActionRow {
  id: i64,
  kind: String,
  method: String,
  url: String,
  payload: Option<String>,
  attempts: u32,
  last_error: Option<String>,
  created_at: String,
}

fn read_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRow> {
  Ok(ActionRow {
    id: row.get(0)?,
    kind: row.get(1)?,
    method: row.get(2)?,
    url: row.get(3)?,
    payload: row.get(4)?,
    attempts: row.get(5)?,
    last_error: row.get(6)?,
    created_at: row.get(7)?,
  })
}

impl ActionRow {
  fn into_action(self) -> Result<PendingAction> {
    let payload = self
      .payload
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| eyre!("Failed to deserialize payload of action {}: {}", self.id, e))?;

    Ok(PendingAction {
      id: self.id,
      kind: self.kind,
      method: self.method,
      url: self.url,
      payload,
      attempts: self.attempts,
      last_error: self.last_error,
      created_at: parse_datetime(&self.created_at)?,
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
