//! Durable foreground settings.
//!
//! The install prompt's decisions are the only state that survives a page
//! reload. They live behind the [`Settings`] trait so tests can swap the
//! SQLite file for memory.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key/value store of boolean flags.
pub trait Settings: Send + Sync {
  /// Read a flag; unknown keys are `false`.
  fn get_flag(&self, key: &str) -> Result<bool>;

  fn set_flag(&self, key: &str, value: bool) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed settings
pub struct SqliteSettings {
  conn: Mutex<Connection>,
}

impl SqliteSettings {
  /// Open or create the settings database at `path`, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open settings at {}: {}", path.display(), e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default settings path
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-cache").join("settings.db"))
  }
}

impl Settings for SqliteSettings {
  fn get_flag(&self, key: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM settings WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", key, e))?;

    Ok(value.as_deref() == Some("true"))
  }

  fn set_flag(&self, key: &str, value: bool) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value.to_string()],
      )
      .map_err(|e| eyre!("Failed to write setting {}: {}", key, e))?;

    Ok(())
  }
}

/// Settings that vanish with the process.
#[derive(Default)]
pub struct MemorySettings {
  flags: Mutex<HashMap<String, bool>>,
}

impl MemorySettings {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Settings for MemorySettings {
  fn get_flag(&self, key: &str) -> Result<bool> {
    let flags = self
      .flags
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(flags.get(key).copied().unwrap_or(false))
  }

  fn set_flag(&self, key: &str, value: bool) -> Result<()> {
    let mut flags = self
      .flags
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    flags.insert(key.to_string(), value);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_settings_default_false() {
    let settings = MemorySettings::new();
    assert!(!settings.get_flag("pwa-installed").unwrap());
    settings.set_flag("pwa-installed", true).unwrap();
    assert!(settings.get_flag("pwa-installed").unwrap());
  }

  #[test]
  fn test_sqlite_settings_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.db");

    {
      let settings = SqliteSettings::open(Some(&path)).unwrap();
      assert!(!settings.get_flag("pwa-install-dismissed").unwrap());
      settings.set_flag("pwa-install-dismissed", true).unwrap();
    }

    let settings = SqliteSettings::open(Some(&path)).unwrap();
    assert!(settings.get_flag("pwa-install-dismissed").unwrap());
    assert!(!settings.get_flag("pwa-installed").unwrap());

    settings.set_flag("pwa-install-dismissed", false).unwrap();
    assert!(!settings.get_flag("pwa-install-dismissed").unwrap());
  }
}
