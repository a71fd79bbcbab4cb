//! Install prompt flow: when to offer installing the app locally.
//!
//! `unknown → eligible → prompted → {accepted, dismissed}`. The decision is
//! persisted so the prompt never comes back on later visits.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::coordinator::SessionState;
use crate::db::Settings;

/// Set once the user turned the prompt down.
pub const DISMISSED_KEY: &str = "pwa-install-dismissed";
/// Set once the app has been installed.
pub const INSTALLED_KEY: &str = "pwa-installed";

pub const DEFAULT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
  Unknown,
  Eligible,
  Prompted,
  Accepted,
  Dismissed,
}

impl PromptState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Accepted | Self::Dismissed)
  }
}

/// What the user chose in the host's native install dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
  Accepted,
  Dismissed,
}

/// The host's deferred install dialog. Usable once.
pub trait DeferredPrompt: Send {
  fn prompt(self: Box<Self>) -> BoxFuture<'static, PromptOutcome>;
}

pub struct InstallPrompt {
  settings: Arc<dyn Settings>,
  delay: Duration,
  state: PromptState,
  deferred: Option<Box<dyn DeferredPrompt>>,
  eligible_at: Option<Instant>,
}

impl InstallPrompt {
  pub fn new(settings: Arc<dyn Settings>, delay: Duration) -> Self {
    Self {
      settings,
      delay,
      state: PromptState::Unknown,
      deferred: None,
      eligible_at: None,
    }
  }

  pub fn state(&self) -> PromptState {
    self.state
  }

  pub fn has_deferred_prompt(&self) -> bool {
    self.deferred.is_some()
  }

  /// Read a durable flag; an unreadable flag counts as set so we never
  /// nag a user whose answer we failed to load.
  fn flag(&self, key: &str) -> bool {
    self.settings.get_flag(key).unwrap_or_else(|e| {
      warn!(key, "failed to read install prompt flag: {}", e);
      true
    })
  }

  fn persist(&self, key: &str) {
    if let Err(e) = self.settings.set_flag(key, true) {
      warn!(key, "failed to persist install prompt decision: {}", e);
    }
  }

  /// The host says the app can be installed and hands over its dialog.
  ///
  /// Returns true if the flow became eligible.
  pub fn on_installable(
    &mut self,
    prompt: Box<dyn DeferredPrompt>,
    session: &SessionState,
    now: Instant,
  ) -> bool {
    match self.state {
      PromptState::Eligible | PromptState::Prompted => {
        // Keep the freshest reference, keep the timer
        self.deferred = Some(prompt);
        return false;
      }
      PromptState::Accepted | PromptState::Dismissed => return false,
      PromptState::Unknown => {}
    }

    if session.is_installed || self.flag(INSTALLED_KEY) {
      debug!("already installed, not prompting");
      return false;
    }
    if self.flag(DISMISSED_KEY) {
      debug!("install prompt dismissed earlier, not prompting");
      return false;
    }

    self.deferred = Some(prompt);
    self.eligible_at = Some(now);
    self.state = PromptState::Eligible;
    debug!(delay = ?self.delay, "install prompt eligible");
    true
  }

  /// When the prompt should be shown, if it is waiting for its delay.
  pub fn due_at(&self) -> Option<Instant> {
    match (self.state, self.eligible_at) {
      (PromptState::Eligible, Some(at)) => Some(at + self.delay),
      _ => None,
    }
  }

  /// Advance the time gate. Returns true when the prompt should be shown now.
  pub fn poll(&mut self, now: Instant) -> bool {
    match self.due_at() {
      Some(due) if now >= due => {
        self.state = PromptState::Prompted;
        info!("showing install prompt");
        true
      }
      _ => false,
    }
  }

  /// The user asked to install. Opens the host dialog and records the answer.
  ///
  /// Only our visible prompt can be accepted. Without a deferred prompt
  /// this does nothing: the host may have withdrawn it before the user acted.
  pub async fn accept(&mut self) -> Option<PromptOutcome> {
    if self.state != PromptState::Prompted {
      debug!(state = ?self.state, "install prompt is not showing");
      return None;
    }
    let Some(deferred) = self.deferred.take() else {
      warn!("install requested but no deferred prompt is held");
      return None;
    };

    let outcome = deferred.prompt().await;
    match outcome {
      PromptOutcome::Accepted => self.finish(PromptState::Accepted),
      PromptOutcome::Dismissed => self.finish(PromptState::Dismissed),
    }
    Some(outcome)
  }

  /// The user closed our prompt without installing. Returns false when no
  /// prompt was showing.
  pub fn dismiss(&mut self) -> bool {
    if self.state != PromptState::Prompted {
      debug!(state = ?self.state, "install prompt is not showing");
      return false;
    }
    self.finish(PromptState::Dismissed);
    true
  }

  /// The host reports the app was installed, by whatever route.
  pub fn on_app_installed(&mut self) {
    if self.state != PromptState::Accepted {
      self.finish(PromptState::Accepted);
    }
  }

  fn finish(&mut self, state: PromptState) {
    let key = match state {
      PromptState::Accepted => INSTALLED_KEY,
      _ => DISMISSED_KEY,
    };
    self.persist(key);
    self.state = state;
    self.deferred = None;
    self.eligible_at = None;
    info!(?state, "install prompt decided");
  }
}
