use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::DEFAULT_EXCLUDED_PREFIXES;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// The origin the cache serves, e.g. `https://app.example.com`
  pub origin: String,
  #[serde(default)]
  pub scope: ScopeConfig,
  #[serde(default)]
  pub prompt: PromptConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeConfig {
  /// Path prefixes that always go to the network
  #[serde(default = "default_excluded_prefixes")]
  pub excluded_prefixes: Vec<String>,
}

impl Default for ScopeConfig {
  fn default() -> Self {
    Self {
      excluded_prefixes: default_excluded_prefixes(),
    }
  }
}

fn default_excluded_prefixes() -> Vec<String> {
  DEFAULT_EXCLUDED_PREFIXES
    .iter()
    .map(|p| p.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
  /// Seconds between becoming eligible and showing the install prompt
  #[serde(default = "default_delay_secs")]
  pub delay_secs: u64,
}

impl Default for PromptConfig {
  fn default() -> Self {
    Self {
      delay_secs: default_delay_secs(),
    }
  }
}

fn default_delay_secs() -> u64 {
  30
}

impl PromptConfig {
  pub fn delay(&self) -> Duration {
    Duration::from_secs(self.delay_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Directory holding `cache.db` and `settings.db` (defaults to the user data dir)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  pub fn cache_db(&self) -> Option<PathBuf> {
    self.path.as_ref().map(|p| p.join("cache.db"))
  }

  pub fn settings_db(&self) -> Option<PathBuf> {
    self.path.as_ref().map(|p| p.join("settings.db"))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive; `RUST_LOG` wins when set
  #[serde(default = "default_log_level")]
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
  ///
  /// With no file at all, `origin` must come from the command line.
  pub fn load(explicit_path: Option<&Path>, origin: Option<String>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match (path, origin) {
      (Some(p), origin) => {
        let config = Self::load_from_path(&p)?;
        match origin {
          Some(origin) => Config { origin, ..config },
          None => config,
        }
      }
      (None, Some(origin)) => Self::with_origin(origin),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found and no --origin given. \
           Create one at ~/.config/offline-cache/config.yaml"
        ))
      }
    };

    config.origin_url()?;
    Ok(config)
  }

  pub fn with_origin(origin: String) -> Self {
    Self {
      origin,
      scope: ScopeConfig::default(),
      prompt: PromptConfig::default(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// The origin as a URL; only http and https are served.
  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("Origin must be http or https, got {}", other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::parse("origin: https://app.example.com\n").unwrap();
    assert_eq!(config.prompt.delay(), Duration::from_secs(30));
    assert_eq!(config.log.level, "info");
    assert!(config.storage.cache_db().is_none());
    assert!(config
      .scope
      .excluded_prefixes
      .iter()
      .any(|p| p == "/api/"));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: http://localhost:3000
scope:
  excluded_prefixes: ["/graphql"]
prompt:
  delay_secs: 5
storage:
  path: /tmp/offline-cache
log:
  level: debug
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.scope.excluded_prefixes, vec!["/graphql".to_string()]);
    assert_eq!(config.prompt.delay_secs, 5);
    assert_eq!(
      config.storage.settings_db(),
      Some(PathBuf::from("/tmp/offline-cache/settings.db"))
    );
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.origin_url().unwrap().as_str(), "http://localhost:3000/");
  }

  #[test]
  fn test_origin_flag_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "origin: https://app.example.com\n").unwrap();

    let config = Config::load(Some(&path), Some("https://staging.example.com".into())).unwrap();
    assert_eq!(config.origin, "https://staging.example.com");
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml")), None).is_err());
  }

  #[test]
  fn test_non_http_origin_rejected() {
    let config = Config::with_origin("file:///srv/app".into());
    assert!(config.origin_url().is_err());
  }
}
