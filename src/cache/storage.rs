//! Generation store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{RequestKey, StoredResponse};

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations, each mapping request
/// keys to stored responses.
pub trait CacheStore: Send + Sync {
  /// Names of every generation currently stored.
  fn names(&self) -> Result<Vec<String>>;

  /// Whether a generation with this name exists.
  fn has(&self, generation: &str) -> Result<bool>;

  /// Create (or replace) a generation with exactly these entries.
  ///
  /// Either every entry becomes visible or none does.
  fn create_generation(
    &self,
    generation: &str,
    entries: &[(RequestKey, StoredResponse)],
  ) -> Result<()>;

  /// Look up a request in a generation.
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response in an existing generation.
  fn put(&self, generation: &str, key: &RequestKey, response: &StoredResponse) -> Result<()>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete(&self, generation: &str) -> Result<bool>;

  /// Descriptions of the request keys stored in a generation.
  fn keys(&self, generation: &str) -> Result<Vec<String>>;
}

/// SQLite-based generation store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
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

  /// A private store that lives only as long as this value.
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

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-cache").join("cache.db"))
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

-- One row per generation store
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Stored responses, keyed by request hash
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    description TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

const INSERT_ENTRY: &str = "INSERT OR REPLACE INTO entries
  (generation, key_hash, description, status, status_text, headers, body, stored_at)
  VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &StoredResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      INSERT_ENTRY,
      params![
        generation,
        key.cache_hash(),
        key.description(),
        response.status,
        response.status_text,
        headers,
        response.body,
        format_datetime(&response.stored_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

  Ok(())
}

impl CacheStore for SqliteStore {
  fn names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn has(&self, generation: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", generation, e))?;

    Ok(found.is_some())
  }

  fn create_generation(
    &self,
    generation: &str,
    entries: &[(RequestKey, StoredResponse)],
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to clear generation {}: {}", generation, e))?;

    tx.execute(
      "INSERT INTO generations (name, created_at) VALUES (?, ?)",
      params![generation, format_datetime(&Utc::now())],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit generation {}: {}", generation, e))?;

    Ok(())
  }

  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, stored_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key.cache_hash()],
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
      .map_err(|e| eyre!("Failed to look up {}: {}", key.description(), e))?;

    match row {
      Some((status, status_text, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          status,
          status_text,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // The foreign key rejects writes into a deleted generation
    insert_entry(&conn, generation, key, response)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, generation: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT description FROM entries WHERE generation = ? ORDER BY description")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![generation], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp stored by [`format_datetime`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::new("GET", &Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn stored(body: &str) -> StoredResponse {
    StoredResponse {
      status: 200,
      status_text: "OK".to_string(),
      headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
      body: body.as_bytes().to_vec(),
      stored_at: Utc::now(),
    }
  }

  #[test]
  fn test_create_and_get() {
    let store = SqliteStore::in_memory().unwrap();
    let entry = stored("<h1>home</h1>");
    store
      .create_generation("v1", &[(key("/"), entry.clone())])
      .unwrap();

    assert!(store.has("v1").unwrap());
    assert_eq!(store.get("v1", &key("/")).unwrap(), Some(entry));
    assert_eq!(store.get("v1", &key("/missing")).unwrap(), None);
    assert_eq!(store.get("v2", &key("/")).unwrap(), None);
  }

  #[test]
  fn test_delete_cascades() {
    let store = SqliteStore::in_memory().unwrap();
    store
      .create_generation("v1", &[(key("/"), stored("a"))])
      .unwrap();
    store
      .create_generation("v2", &[(key("/"), stored("b"))])
      .unwrap();

    assert!(store.delete("v1").unwrap());
    assert!(!store.delete("v1").unwrap());
    assert_eq!(store.names().unwrap(), vec!["v2".to_string()]);
    assert!(store.keys("v1").unwrap().is_empty());
  }

  #[test]
  fn test_put_into_missing_generation_fails() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(store.put("gone", &key("/"), &stored("x")).is_err());
    assert!(store.names().unwrap().is_empty());
  }

  #[test]
  fn test_put_overwrites_entry() {
    let store = SqliteStore::in_memory().unwrap();
    store.create_generation("v1", &[]).unwrap();
    store.put("v1", &key("/a"), &stored("old")).unwrap();
    store.put("v1", &key("/a"), &stored("new")).unwrap();

    let got = store.get("v1", &key("/a")).unwrap().unwrap();
    assert_eq!(got.body, b"new");
    assert_eq!(store.keys("v1").unwrap(), vec!["GET https://app.test/a"]);
  }

  #[test]
  fn test_create_replaces_existing_generation() {
    let store = SqliteStore::in_memory().unwrap();
    store
      .create_generation("v1", &[(key("/old"), stored("a"))])
      .unwrap();
    store
      .create_generation("v1", &[(key("/new"), stored("b"))])
      .unwrap();

    assert_eq!(store.keys("v1").unwrap(), vec!["GET https://app.test/new"]);
  }

  #[test]
  fn test_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open(Some(&path)).unwrap();
      store
        .create_generation("v1", &[(key("/"), stored("persisted"))])
        .unwrap();
    }

    let store = SqliteStore::open(Some(&path)).unwrap();
    let got = store.get("v1", &key("/")).unwrap().unwrap();
    assert_eq!(got.body, b"persisted");
  }
}
