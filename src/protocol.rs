//! Messages exchanged between the cache worker runtime and the foreground.
//!
//! The foreground only ever sends [`ControlMessage`]s and receives
//! [`LifecycleEvent`]s. Neither side holds a reference into the other's state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a cache worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
  pub(crate) fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "worker#{}", self.0)
  }
}

/// Identifier for a page load (a client controlled by a worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
  pub(crate) fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client#{}", self.0)
  }
}

/// Lifecycle state of a cache worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Precaching the manifest into a fresh generation.
  Installing,
  /// Installed and waiting to replace the active worker.
  Installed,
  /// Deleting stale generations.
  Activating,
  /// Serving requests for the scope.
  Activated,
  /// Replaced, failed to install, or unregistered.
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Control messages the foreground may post to a worker.
///
/// Fire-and-forget: the effect is observed through lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
}

/// Push notifications broadcast by the worker runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
  /// A new worker started installing for the scope.
  NewWorkerFound { worker: WorkerId, version: String },
  /// A worker moved to a new lifecycle state.
  WorkerStateChanged { worker: WorkerId, state: WorkerState },
  /// Control of the scope's pages moved to `worker`.
  ControllerChanged { worker: WorkerId },
}
