//! The worker host: an actor that owns the registration for one scope.
//!
//! The runtime holds the installing, waiting and active worker slots, runs
//! installs in the background, applies the activation gate, routes
//! intercepted requests to the active generation, and broadcasts lifecycle
//! events. The foreground talks to it only through a [`RuntimeHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::{CacheWorker, FetchHandler, PrecacheManifest, Scope, WorkerError};
use crate::cache::{CacheLayer, CacheStore, Served};
use crate::http::{Network, Request, RequestMode};
use crate::protocol::{ClientId, ControlMessage, LifecycleEvent, WorkerId, WorkerState};

const EVENT_CAPACITY: usize = 64;

/// Errors returned to the foreground when talking to the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("Cache workers are not supported by this host")]
  Unsupported,

  #[error("Worker runtime has shut down")]
  RuntimeGone,

  #[error("Registration rejected: {0}")]
  Rejected(String),
}

/// Snapshot of the registration for the runtime's scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
  pub scope: Url,
  pub installing: Option<WorkerId>,
  pub waiting: Option<WorkerId>,
  pub active: Option<WorkerId>,
  pub waiting_version: Option<String>,
  pub active_version: Option<String>,
}

enum Command {
  Register {
    manifest: PrecacheManifest,
    reply: oneshot::Sender<Result<RegistrationInfo, RegistrationError>>,
  },
  Unregister {
    reply: oneshot::Sender<bool>,
  },
  Snapshot {
    reply: oneshot::Sender<RegistrationInfo>,
  },
  OpenClient {
    reply: oneshot::Sender<ClientId>,
  },
  CloseClient {
    client: ClientId,
  },
  Fetch {
    client: Option<ClientId>,
    request: Request,
    reply: oneshot::Sender<Served>,
  },
  PostMessage {
    worker: WorkerId,
    message: ControlMessage,
  },
  Generations {
    reply: oneshot::Sender<Vec<String>>,
  },
}

/// An open page.
#[derive(Debug, Clone, Copy)]
struct ClientState {
  /// Worker the page reports as its controller.
  controller: Option<WorkerId>,
  /// Worker whose generation served the page's navigation. The page only
  /// reads from that generation until it navigates again.
  loaded_under: Option<WorkerId>,
}

/// A worker handed back by its background install task.
struct InstallOutcome {
  worker: CacheWorker,
  result: Result<(), WorkerError>,
}

/// Cloneable handle to a running [`WorkerRuntime`].
#[derive(Clone)]
pub struct RuntimeHandle {
  commands: mpsc::UnboundedSender<Command>,
  events: broadcast::Sender<LifecycleEvent>,
}

impl RuntimeHandle {
  /// Receive every lifecycle event broadcast from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.events.subscribe()
  }

  async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
    let (tx, rx) = oneshot::channel();
    self.commands.send(make(tx)).ok()?;
    rx.await.ok()
  }

  /// Register the manifest's generation for the scope.
  ///
  /// Re-registering a version that is already installing, waiting or active
  /// does not start a new install.
  pub async fn register(
    &self,
    manifest: PrecacheManifest,
  ) -> Result<RegistrationInfo, RegistrationError> {
    self
      .request(|reply| Command::Register { manifest, reply })
      .await
      .unwrap_or(Err(RegistrationError::RuntimeGone))
  }

  pub async fn unregister(&self) -> bool {
    self
      .request(|reply| Command::Unregister { reply })
      .await
      .unwrap_or(false)
  }

  pub async fn snapshot(&self) -> Result<RegistrationInfo, RegistrationError> {
    self
      .request(|reply| Command::Snapshot { reply })
      .await
      .ok_or(RegistrationError::RuntimeGone)
  }

  /// Start a page load. The page is controlled by the active worker, if any.
  pub async fn open_client(&self) -> Result<ClientId, RegistrationError> {
    self
      .request(|reply| Command::OpenClient { reply })
      .await
      .ok_or(RegistrationError::RuntimeGone)
  }

  pub fn close_client(&self, client: ClientId) {
    let _ = self.commands.send(Command::CloseClient { client });
  }

  /// Send a request across the interception boundary.
  ///
  /// Never fails: if the runtime is gone the caller gets a synthetic 503.
  pub async fn fetch(&self, client: Option<ClientId>, request: Request) -> Served {
    match self
      .request(|reply| Command::Fetch {
        client,
        request,
        reply,
      })
      .await
    {
      Some(served) => served,
      None => {
        warn!("worker runtime unavailable, answering with 503");
        Served::unavailable()
      }
    }
  }

  /// Fire-and-forget control message to a worker.
  pub fn post_message(&self, worker: WorkerId, message: ControlMessage) {
    if self
      .commands
      .send(Command::PostMessage { worker, message })
      .is_err()
    {
      warn!(%worker, "worker runtime unavailable, message dropped");
    }
  }

  /// Names of the generation stores currently held by the worker context.
  pub async fn generations(&self) -> Vec<String> {
    self
      .request(|reply| Command::Generations { reply })
      .await
      .unwrap_or_default()
  }
}

/// The worker host actor for one scope.
pub struct WorkerRuntime {
  scope: Scope,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  registered: bool,
  /// Worker currently out in its install task, with its version.
  installing: Option<(WorkerId, String)>,
  waiting: Option<CacheWorker>,
  active: Option<CacheWorker>,
  handler: Option<FetchHandler>,
  clients: HashMap<ClientId, ClientState>,
  /// `SKIP_WAITING` posted to a worker that was still installing.
  early_skip: HashSet<WorkerId>,
  events: broadcast::Sender<LifecycleEvent>,
  install_tx: mpsc::UnboundedSender<InstallOutcome>,
}

impl WorkerRuntime {
  /// Spawn the runtime on the current tokio runtime and return its handle.
  ///
  /// The actor stops once every handle has been dropped.
  pub fn spawn(scope: Scope, store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> RuntimeHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (runtime, install_rx) = Self::new(scope, store, network);
    let events = runtime.events.clone();
    tokio::spawn(runtime.run(commands_rx, install_rx));

    RuntimeHandle {
      commands: commands_tx,
      events,
    }
  }

  fn new(
    scope: Scope,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
  ) -> (Self, mpsc::UnboundedReceiver<InstallOutcome>) {
    let (install_tx, install_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let runtime = Self {
      scope,
      store,
      network,
      registered: false,
      installing: None,
      waiting: None,
      active: None,
      handler: None,
      clients: HashMap::new(),
      early_skip: HashSet::new(),
      events,
      install_tx,
    };
    (runtime, install_rx)
  }

  async fn run(
    mut self,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut installs: mpsc::UnboundedReceiver<InstallOutcome>,
  ) {
    loop {
      tokio::select! {
        command = commands.recv() => match command {
          Some(command) => self.handle_command(command).await,
          None => break,
        },
        Some(outcome) = installs.recv() => self.install_finished(outcome).await,
      }
    }
    debug!(scope = %self.scope.origin(), "worker runtime stopped");
  }

  fn emit(&self, event: LifecycleEvent) {
    debug!(?event, "lifecycle event");
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  fn emit_state(&self, worker: WorkerId, state: WorkerState) {
    self.emit(LifecycleEvent::WorkerStateChanged { worker, state });
  }

  fn snapshot(&self) -> RegistrationInfo {
    RegistrationInfo {
      scope: self.scope.origin().clone(),
      installing: self.installing.as_ref().map(|(id, _)| *id),
      waiting: self.waiting.as_ref().map(CacheWorker::id),
      active: self.active.as_ref().map(CacheWorker::id),
      waiting_version: self.waiting.as_ref().map(|w| w.version().to_string()),
      active_version: self.active.as_ref().map(|w| w.version().to_string()),
    }
  }

  async fn handle_command(&mut self, command: Command) {
    match command {
      Command::Register { manifest, reply } => {
        let result = self.register(manifest);
        let _ = reply.send(result);
      }
      Command::Unregister { reply } => {
        let _ = reply.send(self.unregister());
      }
      Command::Snapshot { reply } => {
        let _ = reply.send(self.snapshot());
      }
      Command::OpenClient { reply } => {
        let client = ClientId::next();
        let controller = self.active.as_ref().map(CacheWorker::id);
        self.clients.insert(
          client,
          ClientState {
            controller,
            loaded_under: controller,
          },
        );
        debug!(%client, ?controller, "client opened");
        let _ = reply.send(client);
      }
      Command::CloseClient { client } => {
        if self.clients.remove(&client).is_some() {
          debug!(%client, "client closed");
          self.try_activate().await;
        }
      }
      Command::Fetch {
        client,
        request,
        reply,
      } => self.dispatch_fetch(client, request, reply),
      Command::PostMessage { worker, message } => self.post_message(worker, message).await,
      Command::Generations { reply } => {
        let names = self.store.names().unwrap_or_else(|e| {
          warn!("failed to list generations: {}", e);
          Vec::new()
        });
        let _ = reply.send(names);
      }
    }
  }

  fn register(&mut self, manifest: PrecacheManifest) -> Result<RegistrationInfo, RegistrationError> {
    // Workers only run for network origins
    if !matches!(self.scope.origin().scheme(), "http" | "https") {
      return Err(RegistrationError::Unsupported);
    }
    self.registered = true;
    let version = manifest.version();

    let known = self.installing.as_ref().map(|(_, v)| v.as_str()) == Some(version)
      || self.waiting.as_ref().map(CacheWorker::version) == Some(version)
      || self.active.as_ref().map(CacheWorker::version) == Some(version);
    if known {
      debug!(version, "registration reused");
      return Ok(self.snapshot());
    }

    if let Some((id, installing)) = &self.installing {
      debug!(worker = %id, installing = %installing, version, "install already in progress");
      return Ok(self.snapshot());
    }

    let mut worker = CacheWorker::new(
      manifest,
      self.scope.clone(),
      Arc::clone(&self.store),
      Arc::clone(&self.network),
    )
    .map_err(|e| RegistrationError::Rejected(e.to_string()))?;

    let id = worker.id();
    info!(worker = %id, version = worker.version(), "installing new worker");
    self.installing = Some((id, worker.version().to_string()));
    self.emit(LifecycleEvent::NewWorkerFound {
      worker: id,
      version: worker.version().to_string(),
    });
    self.emit_state(id, WorkerState::Installing);

    let install_tx = self.install_tx.clone();
    tokio::spawn(async move {
      let result = worker.install().await;
      let _ = install_tx.send(InstallOutcome { worker, result });
    });

    Ok(self.snapshot())
  }

  async fn install_finished(&mut self, outcome: InstallOutcome) {
    let InstallOutcome { mut worker, result } = outcome;
    let id = worker.id();
    let skip = self.early_skip.remove(&id);
    let current = self.installing.as_ref().map(|(i, _)| *i) == Some(id);
    if current {
      self.installing = None;
    }

    if !current || !self.registered {
      // Unregistered while the install was running
      debug!(worker = %id, "discarding install from a removed registration");
      worker.set_redundant();
      self.emit_state(id, WorkerState::Redundant);
      return;
    }

    if let Err(e) = result {
      warn!(worker = %id, "install failed, keeping current generation: {}", e);
      self.emit_state(id, WorkerState::Redundant);
      return;
    }

    if skip {
      worker.receive(ControlMessage::SkipWaiting);
    }

    // A newer install replaces a worker still waiting
    if let Some(mut superseded) = self.waiting.take() {
      info!(worker = %superseded.id(), "waiting worker superseded");
      superseded.set_redundant();
      self.emit_state(superseded.id(), WorkerState::Redundant);
    }

    self.waiting = Some(worker);
    self.emit_state(id, WorkerState::Installed);
    self.try_activate().await;
  }

  /// Activate the waiting worker if the gate allows it.
  ///
  /// The gate opens when nothing is active, when the waiting worker asked
  /// to skip waiting, or when no page is controlled by the active worker.
  async fn try_activate(&mut self) {
    let Some(waiting) = &self.waiting else {
      return;
    };

    let active_id = self.active.as_ref().map(CacheWorker::id);
    let controlled = self
      .clients
      .values()
      .filter(|client| client.controller.is_some() && client.controller == active_id)
      .count();
    let skip = waiting.skip_waiting_requested();

    if active_id.is_some() && !skip && controlled > 0 {
      debug!(worker = %waiting.id(), controlled, "worker waiting for controlled pages to close");
      return;
    }

    let Some(mut worker) = self.waiting.take() else {
      return;
    };
    let id = worker.id();
    self.emit_state(id, WorkerState::Activating);

    // Requests queue behind this await, so none reach the new generation
    // before stale stores are gone.
    if let Err(e) = worker.activate().await {
      warn!(worker = %id, "activation failed: {}", e);
      worker.set_redundant();
      self.emit_state(id, WorkerState::Redundant);
      return;
    }

    if let Some(mut old) = self.active.take() {
      old.set_redundant();
      self.emit_state(old.id(), WorkerState::Redundant);
    }

    self.handler = worker.fetch_handler();
    self.active = Some(worker);
    self.emit_state(id, WorkerState::Activated);

    // Claim every open page for the new worker. Pages loaded under an
    // older generation stay pinned to it and go to the network.
    for client in self.clients.values_mut() {
      client.controller = Some(id);
      if client.loaded_under.is_none() {
        client.loaded_under = Some(id);
      }
    }
    self.emit(LifecycleEvent::ControllerChanged { worker: id });
  }

  fn dispatch_fetch(
    &mut self,
    client: Option<ClientId>,
    request: Request,
    reply: oneshot::Sender<Served>,
  ) {
    let active_id = self.active.as_ref().map(CacheWorker::id);
    let pinned = match client {
      Some(client) => match self.clients.get_mut(&client) {
        Some(state) => {
          // A navigation loads a new document under the current generation
          if request.mode == RequestMode::Navigate {
            state.controller = active_id;
            state.loaded_under = active_id;
          }
          if state.controller == state.loaded_under {
            state.controller
          } else {
            None
          }
        }
        None => None,
      },
      None => active_id,
    };

    let handler = match (pinned, active_id, &self.handler) {
      (Some(pinned), Some(active), Some(handler)) if active == pinned => Some(handler.clone()),
      _ => None,
    };

    match handler {
      Some(handler) => {
        debug!(generation = handler.generation(), url = %request.url, "serving from worker");
        tokio::spawn(async move {
          let _ = reply.send(handler.handle(request).await);
        });
      }
      None => {
        // Uncontrolled and stale pages talk to the network directly
        let layer = CacheLayer::new(Arc::clone(&self.store), Arc::clone(&self.network));
        tokio::spawn(async move {
          let _ = reply.send(layer.passthrough(request).await);
        });
      }
    }
  }

  async fn post_message(&mut self, worker: WorkerId, message: ControlMessage) {
    let promote = match self.waiting.as_mut() {
      Some(waiting) if waiting.id() == worker => Some(waiting.receive(message)),
      _ => None,
    };

    match promote {
      Some(true) => self.try_activate().await,
      Some(false) => {}
      None if self.installing.as_ref().map(|(id, _)| *id) == Some(worker) => {
        self.early_skip.insert(worker);
      }
      None => debug!(%worker, ?message, "message for worker with nothing to do"),
    }
  }

  fn unregister(&mut self) -> bool {
    if !self.registered {
      return false;
    }
    self.registered = false;
    if let Some((id, _)) = self.installing.take() {
      debug!(worker = %id, "install in flight will be discarded");
    }
    self.early_skip.clear();

    for mut worker in [self.waiting.take(), self.active.take()].into_iter().flatten() {
      worker.set_redundant();
      self.emit_state(worker.id(), WorkerState::Redundant);
    }
    self.handler = None;
    for client in self.clients.values_mut() {
      client.controller = None;
      client.loaded_under = None;
    }
    info!(scope = %self.scope.origin(), "registration removed");
    true
  }
}
