use crate::error::UnitError;

use std::sync::Weak;

use tokio::sync::watch;
use tracing::trace;

/// Why a unit reached its finished state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
  /// The unit's own code called the finish signal.
  Signaled,
  /// The unit was started without a body and completed as a no-op.
  NoBody,
  /// The body panicked; the unit was finished on its behalf.
  BodyPanicked,
  /// The owning queue's watchdog gave up waiting for the finish signal.
  WatchdogExpired,
  /// The main-thread executor refused the body, so it never ran.
  ExecutorUnavailable,
}

impl FinishReason {
  /// Converts the reason into the outcome reported to a `UnitHandle`.
  pub fn into_result(self) -> Result<(), UnitError> {
    match self {
      FinishReason::Signaled | FinishReason::NoBody => Ok(()),
      FinishReason::BodyPanicked => Err(UnitError::UnitPanicked),
      FinishReason::WatchdogExpired => Err(UnitError::WatchdogExpired),
      FinishReason::ExecutorUnavailable => Err(UnitError::ExecutorUnavailable),
    }
  }
}

/// The observable lifecycle of a unit.
///
/// A unit only moves forward: `Pending` -> `Running` -> `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
  Pending,
  Running,
  Finished(FinishReason),
}

impl UnitState {
  pub fn is_running(&self) -> bool {
    matches!(self, UnitState::Running)
  }

  pub fn is_finished(&self) -> bool {
    matches!(self, UnitState::Finished(_))
  }

  pub fn finish_reason(&self) -> Option<FinishReason> {
    match self {
      UnitState::Finished(reason) => Some(*reason),
      _ => None,
    }
  }
}

/// Shared state cell behind every unit.
///
/// State lives in a `watch` channel so each transition is published to all
/// watchers and is visible to whichever thread reads it next. The
/// `Running -> Finished` flip is a single update; no reader can see a unit
/// that is both running and finished.
#[derive(Debug)]
pub struct UnitLifecycle {
  state: watch::Sender<UnitState>,
}

impl Default for UnitLifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl UnitLifecycle {
  pub fn new() -> Self {
    let (state, _) = watch::channel(UnitState::Pending);
    Self { state }
  }

  /// Returns a snapshot of the current state.
  pub fn state(&self) -> UnitState {
    *self.state.borrow()
  }

  pub fn is_running(&self) -> bool {
    self.state().is_running()
  }

  pub fn is_finished(&self) -> bool {
    self.state().is_finished()
  }

  /// Moves the unit from `Pending` to `Running`.
  ///
  /// # Errors
  /// Returns `UnitError::AlreadyStarted` if the unit left `Pending` earlier.
  pub fn mark_running(&self) -> Result<(), UnitError> {
    let started = self.state.send_if_modified(|state| {
      if *state == UnitState::Pending {
        *state = UnitState::Running;
        true
      } else {
        false
      }
    });
    if started {
      Ok(())
    } else {
      Err(UnitError::AlreadyStarted)
    }
  }

  /// Moves a running unit to `Finished(reason)`.
  ///
  /// Returns `Ok(true)` when this call performed the transition and `Ok(false)`
  /// when the unit was already finished; repeated signals leave the first
  /// reason in place.
  ///
  /// # Errors
  /// Returns `UnitError::NotStarted` if the unit is still pending. The state
  /// is left untouched.
  pub fn finish(&self, reason: FinishReason) -> Result<bool, UnitError> {
    let mut not_started = false;
    let finished = self.state.send_if_modified(|state| match *state {
      UnitState::Running => {
        *state = UnitState::Finished(reason);
        true
      }
      UnitState::Pending => {
        not_started = true;
        false
      }
      UnitState::Finished(_) => false,
    });

    if not_started {
      return Err(UnitError::NotStarted);
    }
    if !finished {
      trace!(?reason, "Finish signal ignored, unit already finished.");
    }
    Ok(finished)
  }

  /// Finishes the unit from whichever state it is in. Used by the queue when
  /// it has to settle a unit the unit could not settle itself.
  pub(crate) fn force_finish(&self, reason: FinishReason) -> bool {
    self.state.send_if_modified(|state| {
      if state.is_finished() {
        false
      } else {
        *state = UnitState::Finished(reason);
        true
      }
    })
  }

  /// Subscribes to state changes.
  pub fn watch(&self) -> UnitWatcher {
    UnitWatcher {
      rx: self.state.subscribe(),
    }
  }
}

/// Receives every state change of one unit.
#[derive(Debug, Clone)]
pub struct UnitWatcher {
  rx: watch::Receiver<UnitState>,
}

impl UnitWatcher {
  pub fn state(&self) -> UnitState {
    *self.rx.borrow()
  }

  /// Waits until the unit is finished and returns the reason. Resolves
  /// immediately if it already is.
  ///
  /// # Errors
  /// Returns `UnitError::UnitReleased` if the unit was dropped without ever
  /// finishing.
  pub async fn finished(&mut self) -> Result<FinishReason, UnitError> {
    let state = self
      .rx
      .wait_for(UnitState::is_finished)
      .await
      .map_err(|_| UnitError::UnitReleased)?;
    state.finish_reason().ok_or(UnitError::UnitReleased)
  }
}

/// A non-owning handle that lets a unit's body report completion.
///
/// Holding a `FinishSignal` never keeps the unit alive, so a body can
/// capture it without forming an ownership cycle with the unit it belongs to.
#[derive(Debug, Clone)]
pub struct FinishSignal {
  pub(crate) lifecycle: Weak<UnitLifecycle>,
}

impl FinishSignal {
  /// Marks the unit finished. Safe to call from any thread, any number of
  /// times; only the first call after `start` has an effect.
  ///
  /// # Errors
  /// Returns `UnitError::NotStarted` before the unit started and
  /// `UnitError::UnitReleased` once the unit has been dropped.
  pub fn signal(&self) -> Result<bool, UnitError> {
    match self.lifecycle.upgrade() {
      Some(lifecycle) => lifecycle.finish(FinishReason::Signaled),
      None => Err(UnitError::UnitReleased),
    }
  }
}
