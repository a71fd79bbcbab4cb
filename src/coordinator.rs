//! Foreground side of the update protocol.
//!
//! The coordinator registers the cache worker, translates lifecycle events
//! into session state the application can show, and performs the
//! user-approved hand-off to a new generation with exactly one reload.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::protocol::{ControlMessage, LifecycleEvent, WorkerId, WorkerState};
use crate::worker::runtime::{RegistrationError, RegistrationInfo, RuntimeHandle};
use crate::worker::PrecacheManifest;

/// Application hooks the coordinator needs from its host page.
pub trait Host: Send + Sync {
  /// Reload the whole application.
  fn reload(&self);
}

/// Session state exposed to the application. Rebuilt on every page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
  pub is_online: bool,
  pub is_installed: bool,
  pub update_available: bool,
}

impl Default for SessionState {
  fn default() -> Self {
    Self {
      is_online: true,
      is_installed: false,
      update_available: false,
    }
  }
}

/// Where the coordinator is in handing off to a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
  Idle,
  /// A new worker is waiting; the user has not acted yet.
  UpdateDetected,
  /// `SKIP_WAITING` sent; reloading on the next controller change.
  Applying,
  /// The one reload has been issued.
  Reloaded,
}

/// Notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
  UpdateAvailable { worker: WorkerId },
  /// The waiting update disappeared without being applied here.
  UpdateWithdrawn,
  OnlineChanged(bool),
  InstalledChanged(bool),
  Reloading,
}

type Listener = Box<dyn Fn(&CoordinatorEvent) + Send>;
type Listeners = Mutex<BTreeMap<u64, Listener>>;

/// Handle returned by [`Coordinator::subscribe`].
pub struct Subscription {
  id: u64,
  listeners: Weak<Listeners>,
}

impl Subscription {
  /// Stop receiving notifications.
  pub fn unsubscribe(self) {
    if let Some(listeners) = self.listeners.upgrade() {
      if let Ok(mut listeners) = listeners.lock() {
        listeners.remove(&self.id);
      }
    }
  }
}

pub struct Coordinator {
  runtime: Option<RuntimeHandle>,
  events: Option<broadcast::Receiver<LifecycleEvent>>,
  manifest: PrecacheManifest,
  host: Arc<dyn Host>,
  registration: Option<RegistrationInfo>,
  /// Worker controlling this page.
  controller: Option<WorkerId>,
  waiting: Option<WorkerId>,
  /// Worker the current update offer refers to.
  offered: Option<WorkerId>,
  /// Installed before registration told us who the controller is.
  pending_installed: Vec<WorkerId>,
  state: SessionState,
  phase: UpdatePhase,
  listeners: Arc<Listeners>,
}

impl Coordinator {
  /// Create a coordinator for one page load.
  ///
  /// `runtime` is `None` when the host has no worker support; the
  /// coordinator then does nothing and the application runs network-only.
  /// Lifecycle events are subscribed to here, before registration.
  pub fn new(runtime: Option<RuntimeHandle>, manifest: PrecacheManifest, host: Arc<dyn Host>) -> Self {
    let events = runtime.as_ref().map(RuntimeHandle::subscribe);
    Self {
      runtime,
      events,
      manifest,
      host,
      registration: None,
      controller: None,
      waiting: None,
      offered: None,
      pending_installed: Vec::new(),
      state: SessionState::default(),
      phase: UpdatePhase::Idle,
      listeners: Arc::new(Mutex::new(BTreeMap::new())),
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn phase(&self) -> UpdatePhase {
    self.phase
  }

  pub fn is_supported(&self) -> bool {
    self.runtime.is_some()
  }

  pub fn controller(&self) -> Option<WorkerId> {
    self.controller
  }

  /// Register the cache worker, reusing an existing registration.
  ///
  /// Failures are logged and leave the coordinator inert.
  pub async fn register(&mut self) -> Option<RegistrationInfo> {
    if let Some(registration) = &self.registration {
      debug!("already registered, reusing registration");
      return Some(registration.clone());
    }

    let Some(runtime) = &self.runtime else {
      warn!("cache worker unsupported, running network-only");
      return None;
    };

    match runtime.register(self.manifest.clone()).await {
      Ok(info) => {
        self.adopt_registration(info.clone());
        Some(info)
      }
      Err(e) => {
        self.disable(e);
        None
      }
    }
  }

  /// Submit the latest build's manifest; a new version starts an install.
  pub async fn check_for_update(&mut self, latest: PrecacheManifest) -> Option<RegistrationInfo> {
    let runtime = self.runtime.as_ref()?;
    if self.registration.is_none() {
      self.manifest = latest;
      return self.register().await;
    }

    match runtime.register(latest.clone()).await {
      Ok(info) => {
        self.manifest = latest;
        self.registration = Some(info.clone());
        Some(info)
      }
      Err(e) => {
        warn!("update check failed: {}", e);
        None
      }
    }
  }

  fn adopt_registration(&mut self, info: RegistrationInfo) {
    info!(
      scope = %info.scope,
      active = ?info.active_version,
      waiting = ?info.waiting_version,
      "cache worker registered"
    );
    self.controller = info.active;
    if self.waiting.is_none() {
      self.waiting = info.waiting;
    }
    self.registration = Some(info);

    // A worker may already be waiting from an earlier page load
    let mut candidates = std::mem::take(&mut self.pending_installed);
    candidates.extend(self.waiting);
    for worker in candidates {
      if self.waiting == Some(worker) {
        self.on_installed(worker);
      }
    }
  }

  fn disable(&mut self, error: RegistrationError) {
    warn!("cache worker registration failed, running network-only: {}", error);
    self.runtime = None;
    self.events = None;
  }

  /// Apply every lifecycle event received so far without waiting.
  ///
  /// Returns true if anything was processed.
  pub fn process_pending(&mut self) -> bool {
    let mut changed = false;
    loop {
      let Some(events) = self.events.as_mut() else {
        return changed;
      };
      match events.try_recv() {
        Ok(event) => {
          self.handle_event(event);
          changed = true;
        }
        Err(TryRecvError::Empty) => return changed,
        Err(TryRecvError::Lagged(missed)) => {
          warn!(missed, "coordinator fell behind lifecycle events");
        }
        Err(TryRecvError::Closed) => {
          self.events = None;
          return changed;
        }
      }
    }
  }

  /// Wait for the next lifecycle event and apply it.
  ///
  /// Returns `None` once the coordinator can no longer receive events.
  pub async fn next_event(&mut self) -> Option<LifecycleEvent> {
    loop {
      let events = self.events.as_mut()?;
      match events.recv().await {
        Ok(event) => {
          self.handle_event(event.clone());
          return Some(event);
        }
        Err(RecvError::Lagged(missed)) => {
          warn!(missed, "coordinator fell behind lifecycle events");
        }
        Err(RecvError::Closed) => {
          self.events = None;
          return None;
        }
      }
    }
  }

  /// Apply one lifecycle event. Tolerates any arrival order.
  pub fn handle_event(&mut self, event: LifecycleEvent) {
    match event {
      LifecycleEvent::NewWorkerFound { worker, version } => {
        debug!(%worker, version, "new worker found");
      }
      LifecycleEvent::WorkerStateChanged { worker, state } => match state {
        WorkerState::Installed => {
          self.waiting = Some(worker);
          if self.registration.is_none() {
            self.pending_installed.push(worker);
          } else {
            self.on_installed(worker);
          }
        }
        WorkerState::Activated => {
          if self.waiting == Some(worker) {
            self.waiting = None;
          }
          if self.phase == UpdatePhase::UpdateDetected && self.offered == Some(worker) {
            // Activated without our consent
            self.withdraw_update();
          }
        }
        WorkerState::Redundant => {
          if self.waiting == Some(worker) {
            self.waiting = None;
          }
          let pending = matches!(self.phase, UpdatePhase::UpdateDetected | UpdatePhase::Applying);
          if pending && self.offered == Some(worker) {
            // Superseded or failed before it took control
            self.withdraw_update();
            if let Some(next) = self.waiting {
              self.on_installed(next);
            }
          }
        }
        WorkerState::Installing | WorkerState::Activating => {}
      },
      LifecycleEvent::ControllerChanged { worker } => self.on_controller_changed(worker),
    }
  }

  fn on_installed(&mut self, worker: WorkerId) {
    match self.controller {
      Some(controller) if controller != worker => {
        if self.phase == UpdatePhase::Idle {
          info!(%worker, "update available");
          self.phase = UpdatePhase::UpdateDetected;
          self.offered = Some(worker);
          self.state.update_available = true;
          self.notify(&CoordinatorEvent::UpdateAvailable { worker });
        }
      }
      Some(_) => {}
      None => debug!(%worker, "first install, not an update"),
    }
  }

  fn withdraw_update(&mut self) {
    self.phase = UpdatePhase::Idle;
    self.offered = None;
    self.state.update_available = false;
    self.notify(&CoordinatorEvent::UpdateWithdrawn);
  }

  fn on_controller_changed(&mut self, worker: WorkerId) {
    self.controller = Some(worker);
    match self.phase {
      UpdatePhase::Applying => {
        info!(%worker, "controller changed, reloading");
        self.phase = UpdatePhase::Reloaded;
        self.offered = None;
        self.state.update_available = false;
        self.notify(&CoordinatorEvent::Reloading);
        self.host.reload();
      }
      UpdatePhase::UpdateDetected => {
        if self.offered == Some(worker) {
          if self.waiting == Some(worker) {
            self.waiting = None;
          }
          self.withdraw_update();
        }
      }
      UpdatePhase::Idle => debug!(%worker, "controller changed"),
      UpdatePhase::Reloaded => debug!(%worker, "controller changed after reload, ignoring"),
    }
  }

  /// Hand off to the waiting worker.
  ///
  /// Only valid after an update was detected. Sends `SKIP_WAITING`; the
  /// reload happens when control changes hands. Returns false (and logs)
  /// when there is nothing to apply.
  pub fn apply_update(&mut self) -> bool {
    if self.phase != UpdatePhase::UpdateDetected || !self.state.update_available {
      warn!(phase = ?self.phase, "no update to apply");
      return false;
    }
    let (Some(runtime), Some(waiting)) = (&self.runtime, self.offered) else {
      warn!("update flagged but no waiting worker present");
      return false;
    };

    info!(worker = %waiting, "applying update");
    runtime.post_message(waiting, ControlMessage::SkipWaiting);
    self.phase = UpdatePhase::Applying;
    true
  }

  /// Mirror the host's connectivity signal. Advisory only.
  pub fn set_online(&mut self, online: bool) {
    if self.state.is_online != online {
      self.state.is_online = online;
      self.notify(&CoordinatorEvent::OnlineChanged(online));
    }
  }

  /// Mirror the host's "running as an installed app" signal.
  pub fn set_installed(&mut self, installed: bool) {
    if self.state.is_installed != installed {
      self.state.is_installed = installed;
      self.notify(&CoordinatorEvent::InstalledChanged(installed));
    }
  }

  pub fn subscribe(&self, listener: impl Fn(&CoordinatorEvent) + Send + 'static) -> Subscription {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.insert(id, Box::new(listener));
    }

    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }

  fn notify(&self, event: &CoordinatorEvent) {
    if let Ok(listeners) = self.listeners.lock() {
      for listener in listeners.values() {
        listener(event);
      }
    }
  }
}
