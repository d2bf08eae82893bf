//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::queue::{DeadLetter, NewPendingWrite, PendingWrite};
use super::traits::CachedResponse;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// Holds both the response regions and the pending-write queue. Every
/// operation is atomic on its own; nothing spans more than one entry.
pub trait CacheStorage: Send + Sync {
  /// Store a response under `key` in `region`, replacing any previous entry.
  /// The key is removed from every other region.
  fn put(&self, region: &str, key: &str, response: &Response) -> Result<()>;

  /// Look up a response. A miss is `Ok(None)`.
  fn get(&self, region: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Names of all regions that currently hold entries.
  fn list_regions(&self) -> Result<Vec<String>>;

  /// Drop a whole region. Returns the number of entries removed.
  fn delete_region(&self, region: &str) -> Result<usize>;

  /// Drop every region not named in `keep`. Returns the dropped names.
  fn delete_all_except(&self, keep: &[String]) -> Result<Vec<String>>;

  /// Append a write to the queue and return its id.
  fn enqueue(&self, write: &NewPendingWrite) -> Result<i64>;

  /// All queued writes in insertion order.
  fn list_pending(&self) -> Result<Vec<PendingWrite>>;

  /// Remove a queued write after a successful replay.
  fn remove_pending(&self, id: i64) -> Result<()>;

  /// Record a failed replay and return the number of failed attempts so far.
  fn record_failure(&self, id: i64, error: &str) -> Result<u32>;

  /// Move a queued write to the dead-letter list.
  fn dead_letter(&self, id: i64, error: &str) -> Result<()>;

  /// All dead letters, oldest failure first.
  fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

  /// Put a dead letter back at the end of the queue. Returns the new pending id,
  /// or `None` if no dead letter has that id.
  fn requeue_dead_letter(&self, id: i64) -> Result<Option<i64>>;
}

/// SQLite-based cache storage implementation.
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

  /// In-memory database, gone when dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    // Queue tables created before credentials were kept
    for table in ["pending_writes", "dead_letters"] {
      if !has_column(&conn, table, "headers")? {
        conn
          .execute(
            &format!("ALTER TABLE {} ADD COLUMN headers TEXT NOT NULL DEFAULT '[]'", table),
            [],
          )
          .map_err(|e| eyre!("Failed to add headers column to {}: {}", table, e))?;
      }
    }

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache and queue tables.
const CACHE_SCHEMA: &str = r#"
-- Cached responses, partitioned by versioned region name
CREATE TABLE IF NOT EXISTS cache_entries (
    region TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (region, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);

-- Writes made while offline, replayed in id order
CREATE TABLE IF NOT EXISTS pending_writes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body BLOB NOT NULL,
    content_type TEXT,
    headers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Replay bookkeeping, kept apart so queued writes are never updated
CREATE TABLE IF NOT EXISTS pending_attempts (
    id INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL
);

-- Writes that exhausted their replay attempts
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body BLOB NOT NULL,
    content_type TEXT,
    headers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    failed_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn put(&self, region: &str, key: &str, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let key_hash = hash_key(key);
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // A key lives in at most one region
    tx.execute(
      "DELETE FROM cache_entries WHERE key_hash = ? AND region != ?",
      params![key_hash, region],
    )
    .map_err(|e| eyre!("Failed to evict key from other regions: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (region, key_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![region, key_hash, key, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store response: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, region: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE region = ? AND key_hash = ?",
        params![region, hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn list_regions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT region FROM cache_entries ORDER BY region")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let regions = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list regions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read region name: {}", e))?;

    Ok(regions)
  }

  fn delete_region(&self, region: &str) -> Result<usize> {
    let conn = self.conn()?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE region = ?",
        params![region],
      )
      .map_err(|e| eyre!("Failed to delete region {}: {}", region, e))
  }

  fn delete_all_except(&self, keep: &[String]) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .list_regions()?
      .into_iter()
      .filter(|region| !keep.contains(region))
      .collect();

    for region in &stale {
      self.delete_region(region)?;
    }

    Ok(stale)
  }

  fn enqueue(&self, write: &NewPendingWrite) -> Result<i64> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&write.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_writes (url, method, body, content_type, headers, created_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![write.url, write.method, write.body, write.content_type, headers],
      )
      .map_err(|e| eyre!("Failed to enqueue write: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list_pending(&self) -> Result<Vec<PendingWrite>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, body, content_type, headers, created_at FROM pending_writes
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, Option<String>>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, String>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending writes: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read pending write: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, body, content_type, headers, created_at)| {
        Ok(PendingWrite {
          id,
          url,
          method,
          body,
          content_type,
          headers: parse_headers(&headers)?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn remove_pending(&self, id: i64) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM pending_attempts WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to clear attempts for write {}: {}", id, e))?;
    tx.execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove write {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT INTO pending_attempts (id, attempts, last_error) VALUES (?, 1, ?)
         ON CONFLICT(id) DO UPDATE SET attempts = attempts + 1, last_error = excluded.last_error",
        params![id, error],
      )
      .map_err(|e| eyre!("Failed to record attempt for write {}: {}", id, e))?;

    conn
      .query_row(
        "SELECT attempts FROM pending_attempts WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read attempts for write {}: {}", id, e))
  }

  fn dead_letter(&self, id: i64, error: &str) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let moved = tx
      .execute(
        "INSERT OR REPLACE INTO dead_letters
           (id, url, method, body, content_type, headers, created_at, attempts, last_error, failed_at)
         SELECT p.id, p.url, p.method, p.body, p.content_type, p.headers, p.created_at,
                COALESCE(a.attempts, 0), ?, datetime('now')
         FROM pending_writes p LEFT JOIN pending_attempts a ON a.id = p.id
         WHERE p.id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to dead-letter write {}: {}", id, e))?;

    if moved == 0 {
      return Err(eyre!("No pending write with id {}", id));
    }

    tx.execute("DELETE FROM pending_attempts WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to clear attempts for write {}: {}", id, e))?;
    tx.execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove write {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, body, content_type, headers, created_at, attempts, last_error, failed_at
         FROM dead_letters ORDER BY failed_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          DeadLetterRow {
            id: row.get(0)?,
            url: row.get(1)?,
            method: row.get(2)?,
            body: row.get(3)?,
            content_type: row.get(4)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
          },
          row.get::<_, String>(5)?,
          row.get::<_, String>(6)?,
          row.get::<_, String>(9)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    rows
      .into_iter()
      .map(|(row, headers, created_at, failed_at)| {
        Ok(DeadLetter {
          id: row.id,
          url: row.url,
          method: row.method,
          body: row.body,
          content_type: row.content_type,
          headers: parse_headers(&headers)?,
          created_at: parse_datetime(&created_at)?,
          attempts: row.attempts,
          last_error: row.last_error,
          failed_at: parse_datetime(&failed_at)?,
        })
      })
      .collect()
  }

  fn requeue_dead_letter(&self, id: i64) -> Result<Option<i64>> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let moved = tx
      .execute(
        "INSERT INTO pending_writes (url, method, body, content_type, headers, created_at)
         SELECT url, method, body, content_type, headers, datetime('now')
         FROM dead_letters WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to requeue dead letter {}: {}", id, e))?;

    if moved == 0 {
      return Ok(None);
    }

    let new_id = tx.last_insert_rowid();

    tx.execute("DELETE FROM dead_letters WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove dead letter {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(Some(new_id))
  }
}

/// Dead-letter columns that need no parsing.
struct DeadLetterRow {
  id: i64,
  url: String,
  method: String,
  body: Vec<u8>,
  content_type: Option<String>,
  attempts: u32,
  last_error: String,
}

/// Whether `table` already has `column`.
fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
  let count: i64 = conn
    .query_row(
      "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
      params![table, column],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to inspect table {}: {}", table, e))?;

  Ok(count > 0)
}

fn parse_headers(s: &str) -> Result<Vec<(String, String)>> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}

/// SHA256 of the request key, for stable fixed-length primary keys.
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
