use crate::config::QueueConfig;
use crate::error::UnitError;
use crate::handle::UnitHandle;
use crate::lifecycle::FinishReason;
use crate::notifier::{CompletionEvent, CompletionNotifier, UnitCompletionInfo, UnitCompletionStatus};
use crate::unit::{AsyncUnit, ManagedUnitInternal, UnitLabel};
use crate::unit_queue::{QueueConsumer, QueueProducer, UnitQueue};

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fibre::mpsc::{self as fibre_mpsc, AsyncSender};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_UNIT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

type LabelSet = Arc<HashSet<UnitLabel>>;
type ResultSender = oneshot::Sender<Result<(), UnitError>>;

/// Bookkeeping for a submitted unit that has not started. Removing the entry
/// from the table is what claims the right to resolve the unit.
struct QueuedUnit {
  token: CancellationToken,
  labels: LabelSet,
  result_sender: Option<ResultSender>,
}

/// Defines how the queue should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits until every started unit has signaled completion.
  /// Queued units that haven't started are discarded.
  Graceful,
  /// Returns without waiting for started units; they keep their slots until
  /// they finish. Queued units that haven't started are discarded.
  Immediate,
}

/// State shared by the dispatch loop and every unit driver it spawns.
#[derive(Clone)]
struct DispatchShared {
  queue_name: Arc<String>,
  queued_units: Arc<DashMap<u64, QueuedUnit>>,
  active_unit_info: Arc<DashMap<u64, LabelSet>>,
  withdraw_notify: Arc<Notify>,
  notifier: Arc<CompletionNotifier>,
  completion_tx: AsyncSender<CompletionEvent>,
  watchdog: Option<Duration>,
}

/// An execution queue that runs at most `concurrency_limit` units at once.
///
/// A unit holds its slot from the moment the queue calls `start` until the
/// unit reports itself finished, not until `start` returns. Units start in
/// submission order; they may finish in any order.
pub struct BoundedUnitQueue {
  queue_name: Arc<String>,
  config: QueueConfig,
  semaphore: Arc<Semaphore>,
  producer: QueueProducer,
  queued_units: Arc<DashMap<u64, QueuedUnit>>,
  active_unit_info: Arc<DashMap<u64, LabelSet>>,
  withdraw_notify: Arc<Notify>,
  notifier: Arc<CompletionNotifier>,
  shutdown_token: CancellationToken,
  worker_join_handle_internal: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedUnitQueue {
  pub fn new(concurrency_limit: usize, queue_capacity: usize, tokio_handle: TokioHandle, queue_name: &str) -> Arc<Self> {
    Self::with_config(QueueConfig::new(concurrency_limit, queue_capacity), tokio_handle, queue_name)
  }

  pub fn with_config(config: QueueConfig, tokio_handle: TokioHandle, queue_name: &str) -> Arc<Self> {
    let config = config.normalized();
    let (producer, consumer) = UnitQueue::new(config.queue_capacity).split();
    let (completion_tx, completion_rx) = fibre_mpsc::unbounded_async();
    let shutdown_token = CancellationToken::new();
    let name = Arc::new(queue_name.to_string());
    let semaphore = Arc::new(Semaphore::new(config.concurrency_limit));
    let queued_units = Arc::new(DashMap::new());
    let active_unit_info = Arc::new(DashMap::new());
    let withdraw_notify = Arc::new(Notify::new());

    let notifier = CompletionNotifier::start(completion_rx, &tokio_handle, name.clone());

    let dispatch_shared = DispatchShared {
      queue_name: name.clone(),
      queued_units: queued_units.clone(),
      active_unit_info: active_unit_info.clone(),
      withdraw_notify: withdraw_notify.clone(),
      notifier: notifier.clone(),
      completion_tx,
      watchdog: config.watchdog,
    };

    let dispatch_join_handle = tokio_handle.spawn(
      Self::run_dispatch_loop(
        dispatch_shared,
        semaphore.clone(),
        consumer,
        tokio_handle.clone(),
        shutdown_token.clone(),
      )
      .instrument(info_span!("unit_queue_dispatch_loop", queue_name = %queue_name)),
    );

    info!(queue_name = %queue_name, concurrency_limit = config.concurrency_limit, queue_capacity = config.queue_capacity, watchdog = ?config.watchdog, "Bounded unit queue created.");

    Arc::new(Self {
      queue_name: name,
      config,
      semaphore,
      producer,
      queued_units,
      active_unit_info,
      withdraw_notify,
      notifier,
      shutdown_token,
      worker_join_handle_internal: Mutex::new(Some(dispatch_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.queue_name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.config.concurrency_limit
  }

  /// Number of units started but not yet finished.
  pub fn active_unit_count(&self) -> usize {
    self.active_unit_info.len()
  }

  /// Returns the current number of units waiting for a slot. Withdrawn
  /// units stop counting once the queue has resolved them.
  pub fn queued_unit_count(&self) -> usize {
    self.queued_units.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Registers a callback invoked on the Tokio runtime each time the queue
  /// resolves a unit from now on. Units resolved earlier are not replayed.
  pub fn add_completion_handler(&self, handler: impl Fn(UnitCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Queues a unit. Waits if `queue_capacity` units are already waiting.
  ///
  /// The queue keeps the unit alive until it has finished; the caller may
  /// drop its own reference right away.
  ///
  /// # Errors
  /// Returns `UnitError::QueueShuttingDown` once shutdown has begun.
  pub async fn submit<U: AsyncUnit>(&self, labels: HashSet<UnitLabel>, unit: Arc<U>) -> Result<UnitHandle, UnitError> {
    if self.shutdown_token.is_cancelled() || self.producer.is_closed() {
      warn!(queue_name = %self.queue_name, "Submit: Attempted to submit unit to a queue that is shutting down or closed.");
      return Err(UnitError::QueueShuttingDown);
    }

    let unit_id = NEXT_UNIT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::channel::<Result<(), UnitError>>();
    let arc_labels = Arc::new(labels);

    debug!(queue_name = %self.queue_name, %unit_id, labels = ?arc_labels, "Submitting unit to queue.");
    self.queued_units.insert(
      unit_id,
      QueuedUnit {
        token: token.clone(),
        labels: arc_labels.clone(),
        result_sender: Some(result_tx),
      },
    );

    match self.producer.send(ManagedUnitInternal { unit_id, unit }, &self.shutdown_token).await {
      Ok(()) => Ok(UnitHandle {
        unit_id,
        cancellation_token: token,
        result_receiver: Some(result_rx),
        labels: arc_labels,
        withdraw_notify: self.withdraw_notify.clone(),
      }),
      Err(send_error) => {
        self.queued_units.remove(&unit_id);
        error!(queue_name = %self.queue_name, %unit_id, "Submit: Failed to enqueue unit: {}", send_error);
        Err(send_error)
      }
    }
  }

  /// Withdraws every queued unit carrying `label_to_cancel` and resolves it
  /// as cancelled. Started units are not affected.
  pub fn cancel_units_by_label(&self, label_to_cancel: &UnitLabel) {
    self.cancel_units_by_labels_internal(&HashSet::from_iter([label_to_cancel.clone()]));
  }

  pub fn cancel_units_by_labels(&self, labels_to_cancel: &HashSet<UnitLabel>) {
    self.cancel_units_by_labels_internal(labels_to_cancel);
  }

  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), UnitError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(queue_name = %self.queue_name, "Initiating explicit queue shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      self.producer.close();
    } else {
      info!(queue_name = %self.queue_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let handle_to_await = self.worker_join_handle_internal.lock().take();
    if let Some(handle) = handle_to_await {
      info!(queue_name = %self.queue_name, "Waiting for dispatch loop to join.");
      match handle.await {
        Ok(()) => info!(queue_name = %self.queue_name, "Dispatch loop successfully joined."),
        Err(join_error) => {
          error!(queue_name = %self.queue_name, "Error joining dispatch loop during shutdown: {:?}.", join_error);
        }
      }
    } else {
      trace!(queue_name = %self.queue_name, "Dispatch join handle already taken by a concurrent shutdown call.");
    }

    if mode == ShutdownMode::Graceful {
      info!(queue_name = %self.queue_name, active = self.active_unit_count(), "Graceful shutdown: waiting for started units to finish.");
      let all_slots = u32::try_from(self.config.concurrency_limit).unwrap_or(u32::MAX);
      match self.semaphore.acquire_many(all_slots).await {
        Ok(permits) => drop(permits),
        Err(_) => warn!(queue_name = %self.queue_name, "Concurrency semaphore closed while draining."),
      }
      self.notifier.await_drained().await;
    }

    if !already_initiating_shutdown {
      info!(queue_name = %self.queue_name, "Queue shutdown process completed by this call.");
    }
    Ok(())
  }

  fn cancel_units_by_labels_internal(&self, labels_to_cancel: &HashSet<UnitLabel>) {
    if labels_to_cancel.is_empty() {
      return;
    }
    info!(queue_name = %self.queue_name, "Requesting cancellation for queued units with labels: {:?}", labels_to_cancel);
    let mut withdrawn = 0usize;
    for entry in self.queued_units.iter() {
      let (unit_id, queued) = entry.pair();
      if !queued.labels.is_disjoint(labels_to_cancel) {
        debug!(queue_name = %self.queue_name, %unit_id, "Signaling cancellation for queued unit due to label match.");
        queued.token.cancel();
        withdrawn += 1;
      }
    }
    if withdrawn > 0 {
      self.withdraw_notify.notify_one();
    }
    let started_matches = self
      .active_unit_info
      .iter()
      .filter(|entry| !entry.value().is_disjoint(labels_to_cancel))
      .count();
    if started_matches > 0 {
      debug!(queue_name = %self.queue_name, started_matches, "Started units matching the labels keep running.");
    }
  }

  async fn run_dispatch_loop(
    shared: DispatchShared,
    semaphore: Arc<Semaphore>,
    consumer: QueueConsumer,
    tokio_handle: TokioHandle,
    shutdown_token: CancellationToken,
  ) {
    info!(queue_name = %*shared.queue_name, "Dispatch loop started.");

    loop {
      tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(queue_name = %*shared.queue_name, "Shutdown signal received. Dispatch loop terminating.");
          break;
        }

        // Withdrawn units are resolved here without waiting for a slot.
        _ = shared.withdraw_notify.notified() => {
          Self::resolve_withdrawn_units(&shared).await;
        }

        permit_acquisition_result = semaphore.clone().acquire_owned() => {
          let permit = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!(queue_name = %*shared.queue_name, "Semaphore closed. Dispatch loop exiting.");
              break;
            }
          };
          trace!(queue_name = %*shared.queue_name, "Acquired concurrency permit. Available: {}", semaphore.available_permits());

          let next_unit: Option<ManagedUnitInternal> = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
              info!(queue_name = %*shared.queue_name, "Shutdown signal received while holding permit. Releasing permit.");
              None
            }
            recv_result = consumer.recv() => recv_result.ok(),
          };

          let Some(managed_unit) = next_unit else {
            drop(permit);
            break;
          };
          let unit_id = managed_unit.unit_id;

          let Some((_, queued)) = shared.queued_units.remove(&unit_id) else {
            trace!(queue_name = %*shared.queue_name, %unit_id, "Dequeued unit was already resolved while queued. Skipping.");
            continue;
          };

          if queued.token.is_cancelled() {
            debug!(queue_name = %*shared.queue_name, %unit_id, "Dequeued unit already cancelled. Not starting it.");
            drop(permit);
            Self::report_outcome(&shared, unit_id, queued.labels, queued.result_sender, Err(UnitError::UnitCancelled)).await;
            continue;
          }

          shared.active_unit_info.insert(unit_id, queued.labels.clone());
          debug!(queue_name = %*shared.queue_name, %unit_id, labels = ?queued.labels, "Dequeued unit. Starting with permit.");

          let driver_shared = shared.clone();
          let cleanup_shared = shared.clone();
          tokio_handle.spawn(
            Self::drive_unit(driver_shared, managed_unit, queued, permit)
              .instrument(info_span!("managed_unit", queue_name = %*shared.queue_name, %unit_id))
              .then(move |_| {
                debug!(queue_name = %*cleanup_shared.queue_name, %unit_id, "Managed unit finished processing.");
                async {}
              }),
          );
        }
      }
    }

    let mut discarded = 0usize;
    while let Ok(managed_unit) = consumer.recv().await {
      let Some((_, queued)) = shared.queued_units.remove(&managed_unit.unit_id) else {
        continue;
      };
      let outcome = if queued.token.is_cancelled() {
        Err(UnitError::UnitCancelled)
      } else {
        discarded += 1;
        Err(UnitError::QueueShuttingDown)
      };
      Self::report_outcome(&shared, managed_unit.unit_id, queued.labels, queued.result_sender, outcome).await;
    }

    info!(
      queue_name = %*shared.queue_name,
      "Dispatch loop stopped. Discarded queued units: {}. Started units still in flight: {}",
      discarded,
      shared.active_unit_info.len()
    );
  }

  /// Resolves every queued unit whose token was cancelled. Their messages
  /// stay in the submit channel and are skipped when dequeued.
  async fn resolve_withdrawn_units(shared: &DispatchShared) {
    let withdrawn: Vec<u64> = shared
      .queued_units
      .iter()
      .filter(|entry| entry.value().token.is_cancelled())
      .map(|entry| *entry.key())
      .collect();

    for unit_id in withdrawn {
      if let Some((_, queued)) = shared.queued_units.remove(&unit_id) {
        debug!(queue_name = %*shared.queue_name, %unit_id, "Queued unit withdrawn. Resolving as cancelled.");
        Self::report_outcome(shared, unit_id, queued.labels, queued.result_sender, Err(UnitError::UnitCancelled)).await;
      }
    }
  }

  async fn drive_unit(
    shared: DispatchShared,
    managed_unit: ManagedUnitInternal,
    queued: QueuedUnit,
    permit: OwnedSemaphorePermit,
  ) {
    let ManagedUnitInternal { unit_id, unit } = managed_unit;

    let outcome = Self::run_to_finish(&shared, unit_id, unit).await;

    shared.active_unit_info.remove(&unit_id);
    drop(permit);
    trace!(queue_name = %*shared.queue_name, %unit_id, "Released concurrency permit.");

    Self::report_outcome(&shared, unit_id, queued.labels, queued.result_sender, outcome).await;
  }

  async fn run_to_finish(shared: &DispatchShared, unit_id: u64, unit: Arc<dyn AsyncUnit>) -> Result<(), UnitError> {
    let mut watcher = unit.watch();

    if std::panic::catch_unwind(AssertUnwindSafe(|| unit.start())).is_err() {
      error!(queue_name = %*shared.queue_name, %unit_id, "Unit panicked inside start. Finishing it.");
      unit.lifecycle().force_finish(FinishReason::BodyPanicked);
    } else if !unit.is_asynchronous() {
      trace!(queue_name = %*shared.queue_name, %unit_id, "Synchronous unit returned from start.");
      unit.lifecycle().force_finish(FinishReason::Signaled);
    }

    let finished = match shared.watchdog {
      None => watcher.finished().await,
      Some(limit) => {
        let waited = tokio::time::timeout(limit, watcher.finished()).await;
        match waited {
          Ok(reason) => reason,
          Err(_) => {
            if unit.lifecycle().force_finish(FinishReason::WatchdogExpired) {
              warn!(queue_name = %*shared.queue_name, %unit_id, ?limit, "Unit did not signal completion before the watchdog expired. Finished it.");
            }
            watcher.finished().await
          }
        }
      }
    };

    finished.and_then(FinishReason::into_result)
  }

  async fn report_outcome(
    shared: &DispatchShared,
    unit_id: u64,
    labels: LabelSet,
    result_sender: Option<ResultSender>,
    outcome: Result<(), UnitError>,
  ) {
    let status = UnitCompletionStatus::from(&outcome);

    if let Some(tx) = result_sender {
      if tx.send(outcome).is_err() {
        trace!(queue_name = %*shared.queue_name, %unit_id, "Unit handle was dropped. Outcome not delivered.");
      }
    }

    if !shared.notifier.has_handlers() {
      return;
    }
    let event = CompletionEvent {
      unit_id,
      queue_name: shared.queue_name.clone(),
      labels,
      status,
      resolved_at: SystemTime::now(),
    };
    if shared.completion_tx.send(event).await.is_err() {
      trace!(queue_name = %*shared.queue_name, %unit_id, "Completion delivery task is gone. Event dropped.");
    }
  }
}

impl Drop for BoundedUnitQueue {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        queue_name = %*self.queue_name,
        "BoundedUnitQueue dropped. Initiating implicit shutdown (signaling dispatch loop to stop, closing queue)."
      );
      self.shutdown_token.cancel();
      self.producer.close();
      // Not joining here: started units may take arbitrarily long to signal.
    } else {
      trace!(queue_name = %*self.queue_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
