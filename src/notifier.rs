use crate::error::UnitError;
use crate::unit::UnitLabel;

use fibre::mpsc::AsyncReceiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// How the queue resolved a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCompletionStatus {
  /// The unit signaled completion (or had no body).
  Success,
  /// The unit was withdrawn before it started.
  Cancelled,
  /// The unit's body panicked.
  Panicked,
  /// The watchdog finished the unit.
  TimedOut,
  /// A main-thread unit's executor had stopped, so its body never ran.
  ExecutorUnavailable,
  /// The queue shut down before the unit could start.
  Discarded,
  QueueErrorOccurred,
}

impl From<&Result<(), UnitError>> for UnitCompletionStatus {
  fn from(result: &Result<(), UnitError>) -> Self {
    match result {
      Ok(()) => UnitCompletionStatus::Success,
      Err(UnitError::UnitCancelled) => UnitCompletionStatus::Cancelled,
      Err(UnitError::UnitPanicked) => UnitCompletionStatus::Panicked,
      Err(UnitError::WatchdogExpired) => UnitCompletionStatus::TimedOut,
      Err(UnitError::ExecutorUnavailable) => UnitCompletionStatus::ExecutorUnavailable,
      Err(UnitError::QueueShuttingDown) => UnitCompletionStatus::Discarded,
      Err(_) => UnitCompletionStatus::QueueErrorOccurred,
    }
  }
}

/// Passed to every completion handler once per resolved unit.
#[derive(Debug, Clone)]
pub struct UnitCompletionInfo {
  pub unit_id: u64,
  pub queue_name: Arc<String>,
  pub labels: Arc<HashSet<UnitLabel>>,
  pub status: UnitCompletionStatus,
  pub completion_time: SystemTime,
}

/// What the queue sends to the delivery task when it resolves a unit.
#[derive(Debug)]
pub(crate) struct CompletionEvent {
  pub(crate) unit_id: u64,
  pub(crate) queue_name: Arc<String>,
  pub(crate) labels: Arc<HashSet<UnitLabel>>,
  pub(crate) status: UnitCompletionStatus,
  pub(crate) resolved_at: SystemTime,
}

impl CompletionEvent {
  fn into_info(self) -> UnitCompletionInfo {
    UnitCompletionInfo {
      unit_id: self.unit_id,
      queue_name: self.queue_name,
      labels: self.labels,
      status: self.status,
      completion_time: self.resolved_at,
    }
  }
}

type CompletionHandler = Arc<dyn Fn(UnitCompletionInfo) + Send + Sync + 'static>;

/// Fans completion events out to the registered handlers.
///
/// The delivery task runs from construction until every event sender is
/// gone. Events arriving while no handler is registered are dropped, so a
/// handler only ever sees units resolved after it was added. Handlers run
/// one after another on the delivery task, in resolution order.
pub(crate) struct CompletionNotifier {
  queue_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("queue_name", &self.queue_name)
      .field("handler_count", &self.handlers.read().len())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn start(
    events: AsyncReceiver<CompletionEvent>,
    tokio_handle: &TokioHandle,
    queue_name: Arc<String>,
  ) -> Arc<Self> {
    let handlers: Arc<RwLock<Vec<CompletionHandler>>> = Arc::new(RwLock::new(Vec::new()));
    let delivery_task = tokio_handle.spawn(
      Self::deliver_events(events, handlers.clone())
        .instrument(info_span!("completion_delivery", queue_name = %*queue_name)),
    );

    Arc::new(Self {
      queue_name,
      handlers,
      delivery_task: Mutex::new(Some(delivery_task)),
    })
  }

  pub(crate) fn has_handlers(&self) -> bool {
    !self.handlers.read().is_empty()
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(UnitCompletionInfo) + Send + Sync + 'static) {
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    info!(queue_name = %*self.queue_name, handlers = handlers.len(), "Completion handler registered.");
  }

  /// Waits for the delivery task to hand out every event still in flight.
  /// Returns once all event senders have been dropped.
  pub(crate) async fn await_drained(&self) {
    let Some(task) = self.delivery_task.lock().take() else {
      trace!(queue_name = %*self.queue_name, "Delivery task already joined.");
      return;
    };
    if let Err(join_error) = task.await {
      error!(queue_name = %*self.queue_name, "Completion delivery task failed: {:?}", join_error);
    }
  }

  async fn deliver_events(events: AsyncReceiver<CompletionEvent>, handlers: Arc<RwLock<Vec<CompletionHandler>>>) {
    let mut delivered = 0u64;
    let mut dropped = 0u64;

    while let Ok(event) = events.recv().await {
      // Snapshot so a handler may register further handlers without deadlocking.
      let current: Vec<CompletionHandler> = handlers.read().clone();
      if current.is_empty() {
        dropped += 1;
        trace!(unit_id = event.unit_id, "No completion handlers registered. Event dropped.");
        continue;
      }

      let info = event.into_info();
      for handler in current {
        let for_handler = info.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(for_handler))).is_err() {
          error!(unit_id = info.unit_id, "A completion handler panicked.");
        }
      }
      delivered += 1;
    }

    debug!(delivered, dropped, "All completion senders gone. Delivery task exiting.");
  }
}
