//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::net::{Request, Response};

/// A response read back from a partition.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Partitions are addressed by name. Lookups follow Cache API rules: only GET
/// requests ever match, and writing a non-GET request is an error.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it doesn't exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Look up a request within one partition.
  #[allow(dead_code)]
  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across all partitions, oldest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the same request.
  ///
  /// Fails if the partition has been deleted since it was opened.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a batch of responses atomically: either all entries are written
  /// or none are.
  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Names of all existing partitions in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Number of entries stored in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a cache database at the given path.
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

  /// Create a throwaway in-memory store.
  #[cfg(test)]
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

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named partitions; seq preserves creation order for unscoped matching
CREATE TABLE IF NOT EXISTS partitions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Cached responses, one per request URL per partition
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);
"#;

/// SHA256 of the cache URL for stable, fixed-length keys.
fn key_hash(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.cache_url().as_bytes());
  hex::encode(hasher.finalize())
}

fn ensure_cacheable(request: &Request) -> Result<()> {
  if request.is_get() {
    Ok(())
  } else {
    Err(eyre!(
      "Refusing to cache {} {}: only GET requests are cacheable",
      request.method,
      request.url
    ))
  }
}

fn partition_exists(conn: &Connection, partition: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM partitions WHERE name = ?",
      params![partition],
      |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(|e| eyre!("Failed to look up partition {}: {}", partition, e))
}

fn insert_entry(
  conn: &Connection,
  partition: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  ensure_cacheable(request)?;
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (partition, key_hash, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key_hash(request),
        request.cache_url(),
        response.status,
        response.status_text,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request.url, e))?;

  Ok(())
}

type EntryRow = (u16, String, String, Vec<u8>, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_cached(row: EntryRow) -> Result<CachedResponse> {
  let (status, status_text, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      status_text,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    Ok(())
  }

  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key_hash(request)],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query partition {}: {}", partition, e))?;

    row.map(into_cached).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        "SELECT e.status, e.status_text, e.headers, e.body, e.cached_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.key_hash = ?
         ORDER BY p.seq
         LIMIT 1",
        params![key_hash(request)],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    row.map(into_cached).transpose()
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !partition_exists(&conn, partition)? {
      return Err(eyre!(
        "Partition {} no longer exists, dropping write for {}",
        partition,
        request.url
      ));
    }

    insert_entry(&conn, partition, request, response)
  }

  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Rolls back on drop unless committed
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    if !partition_exists(&tx, partition)? {
      return Err(eyre!("Partition {} does not exist", partition));
    }

    for (request, response) in entries {
      insert_entry(&tx, partition, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    Ok(deleted > 0)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", partition, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[test]
  fn test_put_and_match_in_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("static-v1").unwrap();

    let request = get("https://app.example.com/index.html");
    let mut response = Response::new(200, "OK", "<html></html>");
    response
      .headers
      .push(("content-type".to_string(), "text/html".to_string()));
    storage.put("static-v1", &request, &response).unwrap();

    let cached = storage.match_in("static-v1", &request).unwrap().unwrap();
    assert_eq!(cached.response, response);
    assert!(storage.match_in("other", &request).unwrap().is_none());
  }

  #[test]
  fn test_match_ignores_fragment() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("dynamic").unwrap();
    storage
      .put("dynamic", &get("https://app.example.com/a.js"), &Response::new(200, "OK", "a"))
      .unwrap();

    let hit = storage
      .match_any(&get("https://app.example.com/a.js#section"))
      .unwrap();
    assert!(hit.is_some());
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("first").unwrap();
    storage.open("second").unwrap();

    let request = get("https://app.example.com/style.css");
    storage
      .put("second", &request, &Response::new(200, "OK", "second"))
      .unwrap();
    storage
      .put("first", &request, &Response::new(200, "OK", "first"))
      .unwrap();

    let hit = storage.match_any(&request).unwrap().unwrap();
    assert_eq!(hit.response.text(), "first");
  }

  #[test]
  fn test_non_get_never_stored_or_matched() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("dynamic").unwrap();

    let post = Request::parse("POST", "https://app.example.com/api").unwrap();
    assert!(storage
      .put("dynamic", &post, &Response::new(200, "OK", "x"))
      .is_err());
    assert_eq!(storage.entry_count("dynamic").unwrap(), 0);

    storage
      .put("dynamic", &get("https://app.example.com/api"), &Response::new(200, "OK", "x"))
      .unwrap();
    assert!(storage.match_any(&post).unwrap().is_none());
  }

  #[test]
  fn test_put_after_delete_is_dropped() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("dynamic").unwrap();
    assert!(storage.delete_partition("dynamic").unwrap());

    let request = get("https://app.example.com/late.js");
    assert!(storage
      .put("dynamic", &request, &Response::new(200, "OK", "late"))
      .is_err());
    assert!(storage.partition_names().unwrap().is_empty());
  }

  #[test]
  fn test_delete_cascades_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("old").unwrap();
    let request = get("https://app.example.com/");
    storage
      .put("old", &request, &Response::new(200, "OK", "x"))
      .unwrap();

    assert!(storage.delete_partition("old").unwrap());
    assert!(!storage.delete_partition("old").unwrap());
    assert!(storage.match_any(&request).unwrap().is_none());

    // Recreated partition starts empty
    storage.open("old").unwrap();
    assert_eq!(storage.entry_count("old").unwrap(), 0);
  }

  #[test]
  fn test_put_all_is_atomic() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("static").unwrap();

    let batch = vec![
      (get("https://app.example.com/a"), Response::new(200, "OK", "a")),
      (
        Request::parse("PUT", "https://app.example.com/b").unwrap(),
        Response::new(200, "OK", "b"),
      ),
    ];
    assert!(storage.put_all("static", &batch).is_err());
    assert_eq!(storage.entry_count("static").unwrap(), 0);

    let batch = vec![
      (get("https://app.example.com/a"), Response::new(200, "OK", "a")),
      (get("https://app.example.com/b"), Response::new(200, "OK", "b")),
    ];
    storage.put_all("static", &batch).unwrap();
    assert_eq!(storage.entry_count("static").unwrap(), 2);
  }

  #[test]
  fn test_partition_names_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("b").unwrap();
    storage.open("a").unwrap();
    storage.open("b").unwrap();

    assert_eq!(storage.partition_names().unwrap(), vec!["b", "a"]);
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let request = get("https://app.example.com/manifest.json");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open("static").unwrap();
      storage
        .put("static", &request, &Response::new(200, "OK", "{}"))
        .unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let hit = storage.match_in("static", &request).unwrap().unwrap();
    assert_eq!(hit.response.text(), "{}");
  }
}
