mod app;
mod cache;
mod commands;
mod config;
mod coordinator;
mod db;
mod event;
mod http;
mod prompt;
mod protocol;
mod worker;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::SqliteStore;
use crate::db::{MemorySettings, Settings, SqliteSettings};
use crate::http::{HttpNetwork, SwitchedNetwork};
use crate::worker::runtime::WorkerRuntime;
use crate::worker::Scope;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "An offline-capable request cache with versioned generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,
}

/// Log to a daily file so the shell output stays readable.
fn init_logging(config: &config::Config) -> Result<WorkerGuard> {
  let dir = match &config.storage.path {
    Some(path) => path.join("logs"),
    None => dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("offline-cache")
      .join("logs"),
  };
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(dir, "offline-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref(), args.origin)?;
  let _guard = init_logging(&config)?;

  let origin = config.origin_url()?;
  info!(%origin, "starting");

  let store = Arc::new(SqliteStore::open(config.storage.cache_db().as_deref())?);
  let network = SwitchedNetwork::new(Arc::new(HttpNetwork::new(origin.clone())?));
  let scope = Scope::with_exclusions(origin, config.scope.excluded_prefixes.clone());
  let runtime = WorkerRuntime::spawn(scope, store, Arc::new(network.clone()));

  let settings: Arc<dyn Settings> = match SqliteSettings::open(config.storage.settings_db().as_deref()) {
    Ok(settings) => Arc::new(settings),
    Err(e) => {
      warn!("settings unavailable, install prompt decisions will not persist: {}", e);
      Arc::new(MemorySettings::new())
    }
  };

  // Initialize and run the app
  let mut app = app::App::new(config, runtime, network, settings)?;
  app.run().await?;

  Ok(())
}
