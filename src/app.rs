use crate::cache::{ServeSource, Served};
use crate::commands::{self, COMMANDS};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorEvent, Host, Subscription};
use crate::db::Settings;
use crate::event::{Event, EventHandler};
use crate::http::{Request, SwitchedNetwork};
use crate::prompt::{DeferredPrompt, InstallPrompt, PromptOutcome};
use crate::protocol::ClientId;
use crate::worker::runtime::RuntimeHandle;
use crate::worker::PrecacheManifest;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Reload requests from the coordinator, picked up by the shell loop.
#[derive(Default)]
pub struct ShellHost {
  reload_requested: AtomicBool,
}

impl ShellHost {
  fn take_reload(&self) -> bool {
    self.reload_requested.swap(false, Ordering::SeqCst)
  }
}

impl Host for ShellHost {
  fn reload(&self) {
    self.reload_requested.store(true, Ordering::SeqCst);
  }
}

/// The host's install dialog; in the shell the user already said yes by
/// typing `accept`.
struct ShellInstallDialog;

impl DeferredPrompt for ShellInstallDialog {
  fn prompt(self: Box<Self>) -> BoxFuture<'static, PromptOutcome> {
    Box::pin(async { PromptOutcome::Accepted })
  }
}

/// One loaded page: its client id, coordinator and install prompt.
struct Page {
  client: Option<ClientId>,
  coordinator: Coordinator,
  prompt: InstallPrompt,
  subscription: Subscription,
}

/// Main application state
pub struct App {
  config: Config,
  origin: Url,
  runtime: RuntimeHandle,
  network: SwitchedNetwork,
  settings: Arc<dyn Settings>,

  /// Latest version published by the origin
  manifest: PrecacheManifest,

  host: Arc<ShellHost>,
  page: Option<Page>,

  /// Coordinator notifications waiting to be printed
  notices: Arc<Mutex<Vec<String>>>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(
    config: Config,
    runtime: RuntimeHandle,
    network: SwitchedNetwork,
    settings: Arc<dyn Settings>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    Ok(Self {
      config,
      origin,
      runtime,
      network,
      settings,
      manifest: PrecacheManifest::builtin(),
      host: Arc::new(ShellHost::default()),
      page: None,
      notices: Arc::new(Mutex::new(Vec::new())),
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(250));

    let lines = self.open_page().await;
    self.print(lines);
    self.print_prompt();

    while !self.should_quit {
      let event = match self.page.as_mut() {
        Some(page) => tokio::select! {
          event = events.next() => event,
          Some(lifecycle) = page.coordinator.next_event() => Some(Event::Lifecycle(lifecycle)),
        },
        None => events.next().await,
      };
      let Some(event) = event else {
        break;
      };

      let lines = self.handle_event(event).await;
      if !lines.is_empty() {
        self.print(lines);
        self.print_prompt();
      }
    }

    if let Some(page) = self.page.take() {
      self.close_page(page);
    }
    Ok(())
  }

  fn print(&self, lines: Vec<String>) {
    for line in lines {
      println!("{}", line);
    }
  }

  fn print_prompt(&self) {
    print!("> ");
    let _ = std::io::stdout().flush();
  }

  async fn handle_event(&mut self, event: Event) -> Vec<String> {
    let mut lines = match event {
      Event::Line(line) => match self.execute(&line).await {
        Ok(lines) => lines,
        Err(e) => vec![format!("Error: {}", e)],
      },
      Event::Eof => {
        self.should_quit = true;
        Vec::new()
      }
      Event::Tick => self.tick(Instant::now()),
      Event::Lifecycle(event) => {
        debug!(?event, "lifecycle event applied");
        Vec::new()
      }
    };
    lines.extend(self.settle().await);
    lines
  }

  /// Drain lifecycle events, reload if asked to, and collect notices.
  async fn settle(&mut self) -> Vec<String> {
    if let Some(page) = self.page.as_mut() {
      page.coordinator.process_pending();
    }

    let mut lines = self.take_notices();
    if self.host.take_reload() {
      lines.push("Reloading...".to_string());
      lines.extend(self.open_page().await);
      lines.extend(self.take_notices());
    }
    lines
  }

  fn take_notices(&self) -> Vec<String> {
    self
      .notices
      .lock()
      .map(|mut notices| std::mem::take(&mut *notices))
      .unwrap_or_default()
  }

  fn tick(&mut self, now: Instant) -> Vec<String> {
    let Some(page) = self.page.as_mut() else {
      return Vec::new();
    };
    if page.prompt.poll(now) {
      vec!["Install this app for offline use? Type `accept` or `dismiss`.".to_string()]
    } else {
      Vec::new()
    }
  }

  /// Load the app in a fresh page, replacing the current one.
  async fn open_page(&mut self) -> Vec<String> {
    if let Some(page) = self.page.take() {
      self.close_page(page);
    }

    let mut coordinator = Coordinator::new(
      Some(self.runtime.clone()),
      self.manifest.clone(),
      self.host.clone(),
    );
    coordinator.set_online(self.network.is_online());

    let notices = self.notices.clone();
    let subscription = coordinator.subscribe(move |event| {
      let line = match event {
        CoordinatorEvent::UpdateAvailable { worker } => {
          format!("Update available ({}). Type `update` to apply.", worker)
        }
        CoordinatorEvent::UpdateWithdrawn => "Update no longer pending.".to_string(),
        CoordinatorEvent::OnlineChanged(true) => "Back online.".to_string(),
        CoordinatorEvent::OnlineChanged(false) => "You are offline.".to_string(),
        CoordinatorEvent::InstalledChanged(installed) => format!("Installed: {}", installed),
        CoordinatorEvent::Reloading => return,
      };
      if let Ok(mut notices) = notices.lock() {
        notices.push(line);
      }
    });

    let client = match self.runtime.open_client().await {
      Ok(client) => Some(client),
      Err(e) => {
        debug!("page opened without a client: {}", e);
        None
      }
    };

    let mut lines = Vec::new();
    match coordinator.register().await {
      Some(info) => lines.push(format!(
        "Loaded {} (active: {}, waiting: {})",
        self.origin,
        info.active_version.as_deref().unwrap_or("none"),
        info.waiting_version.as_deref().unwrap_or("none"),
      )),
      None => lines.push(format!("Loaded {} without offline support", self.origin)),
    }

    let prompt = InstallPrompt::new(self.settings.clone(), self.config.prompt.delay());
    info!(?client, "page opened");
    self.page = Some(Page {
      client,
      coordinator,
      prompt,
      subscription,
    });
    lines
  }

  fn close_page(&self, page: Page) {
    page.subscription.unsubscribe();
    if let Some(client) = page.client {
      self.runtime.close_client(client);
    }
  }

  fn page(&mut self) -> Result<&mut Page> {
    self.page.as_mut().ok_or_else(|| eyre!("No page loaded. Type `open`."))
  }

  /// Run one shell line and return what to print.
  pub async fn execute(&mut self, line: &str) -> Result<Vec<String>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
      return Ok(Vec::new());
    };
    let args: Vec<&str> = words.collect();

    let Some(command) = commands::resolve(word) else {
      let suggestions: Vec<&str> = commands::get_suggestions(word)
        .iter()
        .map(|c| c.name)
        .collect();
      return Ok(vec![if suggestions.is_empty() {
        format!("Unknown command: {}. Type `help`.", word)
      } else {
        format!("Ambiguous command: {} ({})", word, suggestions.join(", "))
      }]);
    };

    let lines = match command.name {
      "open" => self.open_page().await,
      "get" => self.get(&args).await?,
      "deploy" => self.deploy(&args).await?,
      "update" => {
        if self.page()?.coordinator.apply_update() {
          vec!["Applying update...".to_string()]
        } else {
          vec!["No update waiting.".to_string()]
        }
      }
      "online" | "offline" => {
        let online = command.name == "online";
        self.network.set_online(online);
        self.page()?.coordinator.set_online(online);
        Vec::new()
      }
      "status" => self.status().await,
      "generations" => {
        let names = self.runtime.generations().await;
        if names.is_empty() {
          vec!["No generations stored.".to_string()]
        } else {
          names
        }
      }
      "installable" => {
        let page = self.page()?;
        let session = page.coordinator.state();
        if page
          .prompt
          .on_installable(Box::new(ShellInstallDialog), &session, Instant::now())
        {
          vec![format!(
            "App is installable; prompting in {}s.",
            self.config.prompt.delay_secs
          )]
        } else {
          vec!["Install prompt not offered.".to_string()]
        }
      }
      "accept" => {
        let page = self.page()?;
        match page.prompt.accept().await {
          Some(PromptOutcome::Accepted) => {
            page.coordinator.set_installed(true);
            Vec::new()
          }
          Some(PromptOutcome::Dismissed) => vec!["Install declined.".to_string()],
          None => vec!["Nothing to install right now.".to_string()],
        }
      }
      "dismiss" => {
        if self.page()?.prompt.dismiss() {
          vec!["Install prompt dismissed.".to_string()]
        } else {
          vec!["No install prompt is showing.".to_string()]
        }
      }
      "unregister" => {
        if self.runtime.unregister().await {
          vec!["Registration removed.".to_string()]
        } else {
          vec!["Nothing registered.".to_string()]
        }
      }
      "help" => COMMANDS
        .iter()
        .map(|c| format!("{:<22} {}", c.usage, c.description))
        .collect(),
      "quit" => {
        self.should_quit = true;
        Vec::new()
      }
      other => vec![format!("Unhandled command: {}", other)],
    };
    Ok(lines)
  }

  async fn get(&mut self, args: &[&str]) -> Result<Vec<String>> {
    let path = args
      .iter()
      .find(|a| !a.starts_with("--"))
      .ok_or_else(|| eyre!("Usage: get <path> [--html]"))?;
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
    let request = if args.contains(&"--html") {
      Request::navigate(url)
    } else {
      Request::get(url)
    };

    let client = self.page()?.client;
    let served = self.runtime.fetch(client, request).await;
    Ok(vec![describe(&served)])
  }

  async fn deploy(&mut self, args: &[&str]) -> Result<Vec<String>> {
    let version = args
      .first()
      .ok_or_else(|| eyre!("Usage: deploy <version>"))?;
    self.manifest = self.manifest.with_version(version);

    let latest = self.manifest.clone();
    match self.page()?.coordinator.check_for_update(latest).await {
      Some(_) => Ok(vec![format!("Published {}; checking for update.", version)]),
      None => Ok(vec![format!("Published {}; registration unavailable.", version)]),
    }
  }

  async fn status(&mut self) -> Vec<String> {
    let registration = self.runtime.snapshot().await.ok();
    let Some(page) = self.page.as_ref() else {
      return vec!["No page loaded.".to_string()];
    };
    let state = page.coordinator.state();
    let mut lines = vec![
      format!("online: {}", state.is_online),
      format!("installed: {}", state.is_installed),
      format!("update available: {}", state.update_available),
      format!("update phase: {:?}", page.coordinator.phase()),
      format!(
        "install prompt: {:?}{}",
        page.prompt.state(),
        if page.prompt.has_deferred_prompt() { " (dialog held)" } else { "" }
      ),
    ];
    if !page.coordinator.is_supported() {
      lines.push("offline support: unavailable".to_string());
    }
    match page.coordinator.controller() {
      Some(worker) => lines.push(format!("controller: {}", worker)),
      None => lines.push("controller: none".to_string()),
    }
    if let Some(info) = registration {
      lines.push(format!(
        "registration: {} active={} waiting={}",
        info.scope,
        info.active_version.as_deref().unwrap_or("none"),
        info.waiting_version.as_deref().unwrap_or("none"),
      ));
    }
    lines
  }
}

fn describe(served: &Served) -> String {
  let source = match served.source {
    ServeSource::Cache => "cache",
    ServeSource::Network => "network",
    ServeSource::Passthrough => "network (passthrough)",
    ServeSource::OfflineFallback => "offline page",
    ServeSource::Unavailable => "unavailable",
  };
  let mut line = format!(
    "{} {} ({} bytes) from {}",
    served.response.status,
    served.response.status_text,
    served.response.body.len(),
    source
  );
  if let Some(at) = served.cached_at {
    line.push_str(&format!(", cached {}", at.format("%Y-%m-%d %H:%M:%S")));
  }
  line
}
