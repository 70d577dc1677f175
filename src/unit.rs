use crate::error::UnitError;
use crate::lifecycle::{FinishReason, FinishSignal, UnitLifecycle, UnitState, UnitWatcher};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// A descriptive label for a unit, typically a `String`.
pub type UnitLabel = String;

/// The work closure attached to a unit. Runs exactly once.
pub type UnitBody = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work whose completion is reported by the work itself.
///
/// The queue calls `start` once a concurrency slot is free. For an
/// asynchronous unit, `start` returning says nothing about completion: the
/// slot stays occupied until the unit's lifecycle reaches `Finished`, which
/// the unit's own code triggers through `signal_finished` or a
/// [`FinishSignal`].
pub trait AsyncUnit: Send + Sync + 'static {
  /// Begins the unit. Must return promptly and must move the lifecycle out
  /// of `Pending`.
  fn start(&self);

  /// The state cell the queue observes.
  fn lifecycle(&self) -> &UnitLifecycle;

  /// Whether the unit outlives the return of `start`. When `false` the
  /// queue treats `start` returning as completion.
  fn is_asynchronous(&self) -> bool {
    true
  }

  fn is_running(&self) -> bool {
    self.lifecycle().is_running()
  }

  fn is_finished(&self) -> bool {
    self.lifecycle().is_finished()
  }

  /// Marks the unit finished. See [`UnitLifecycle::finish`].
  fn signal_finished(&self) -> Result<bool, UnitError> {
    self.lifecycle().finish(FinishReason::Signaled)
  }

  fn watch(&self) -> UnitWatcher {
    self.lifecycle().watch()
  }
}

/// Body slot and lifecycle shared by the built-in unit types.
pub(crate) struct UnitCore {
  lifecycle: Arc<UnitLifecycle>,
  body: Mutex<Option<UnitBody>>,
}

impl UnitCore {
  pub(crate) fn new(body: Option<UnitBody>) -> Self {
    Self {
      lifecycle: Arc::new(UnitLifecycle::new()),
      body: Mutex::new(body),
    }
  }

  pub(crate) fn lifecycle(&self) -> &UnitLifecycle {
    &self.lifecycle
  }

  pub(crate) fn shared_lifecycle(&self) -> Arc<UnitLifecycle> {
    self.lifecycle.clone()
  }

  pub(crate) fn finish_signal(&self) -> FinishSignal {
    FinishSignal {
      lifecycle: Arc::downgrade(&self.lifecycle),
    }
  }

  pub(crate) fn has_body(&self) -> bool {
    self.body.lock().is_some()
  }

  pub(crate) fn set_body(&self, body: UnitBody) -> Result<(), UnitError> {
    let mut slot = self.body.lock();
    if self.lifecycle.state() != UnitState::Pending {
      return Err(UnitError::AlreadyStarted);
    }
    *slot = Some(body);
    Ok(())
  }

  /// Marks the unit running and hands out its body. The body slot lock is
  /// held across the transition so a concurrent `set_body` either lands
  /// before the start or is rejected.
  pub(crate) fn begin(&self) -> Result<Option<UnitBody>, UnitError> {
    let mut slot = self.body.lock();
    self.lifecycle.mark_running()?;
    Ok(slot.take())
  }
}

impl fmt::Debug for UnitCore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnitCore")
      .field("state", &self.lifecycle.state())
      .field("has_body", &self.has_body())
      .finish()
  }
}

/// Runs a body, finishing the unit on its behalf if the body panics.
pub(crate) fn run_body(lifecycle: &UnitLifecycle, body: UnitBody) {
  if std::panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
    error!("Unit body panicked before signaling completion. Finishing unit.");
    let _ = lifecycle.finish(FinishReason::BodyPanicked);
  }
}

/// The basic asynchronous unit: its body runs inline on whichever thread
/// the queue starts it from.
///
/// ```no_run
/// # use unit_orchestra::{AsyncUnit, SignaledUnit};
/// let unit = SignaledUnit::new();
/// let finish = unit.finish_signal();
/// unit
///   .set_body(move || {
///     std::thread::spawn(move || {
///       // ... some callback-based operation completes here ...
///       let _ = finish.signal();
///     });
///   })
///   .unwrap();
/// ```
#[derive(Debug)]
pub struct SignaledUnit {
  core: UnitCore,
}

impl Default for SignaledUnit {
  fn default() -> Self {
    Self::new()
  }
}

impl SignaledUnit {
  /// Creates a unit with no body. Started as-is it completes immediately.
  pub fn new() -> Self {
    Self { core: UnitCore::new(None) }
  }

  pub fn with_body(body: impl FnOnce() + Send + 'static) -> Self {
    Self {
      core: UnitCore::new(Some(Box::new(body))),
    }
  }

  /// Attaches or replaces the body.
  ///
  /// # Errors
  /// Returns `UnitError::AlreadyStarted` once the unit has been started.
  pub fn set_body(&self, body: impl FnOnce() + Send + 'static) -> Result<(), UnitError> {
    self.core.set_body(Box::new(body))
  }

  /// A non-owning handle for the body to report completion with.
  pub fn finish_signal(&self) -> FinishSignal {
    self.core.finish_signal()
  }
}

impl AsyncUnit for SignaledUnit {
  fn start(&self) {
    match self.core.begin() {
      Ok(Some(body)) => run_body(self.core.lifecycle(), body),
      Ok(None) => {
        debug!("Unit started without a body. Finishing immediately.");
        let _ = self.core.lifecycle().finish(FinishReason::NoBody);
      }
      Err(e) => warn!("Ignoring start request: {}", e),
    }
  }

  fn lifecycle(&self) -> &UnitLifecycle {
    self.core.lifecycle()
  }
}

/// A submitted unit as it travels through the submit channel. Its
/// bookkeeping (labels, cancellation, result sender) stays in the queue's
/// table of queued units so it can be resolved without being dequeued.
pub(crate) struct ManagedUnitInternal {
  pub(crate) unit_id: u64,
  pub(crate) unit: Arc<dyn AsyncUnit>,
}
