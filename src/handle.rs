use crate::error::UnitError;
use crate::unit::UnitLabel;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// A handle to a unit submitted to a `BoundedUnitQueue`.
///
/// Allows withdrawing the unit while it is still queued and awaiting the
/// moment the queue released it.
#[derive(Debug)]
pub struct UnitHandle {
  pub(crate) unit_id: u64,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<(), UnitError>>>,
  pub(crate) labels: Arc<HashSet<UnitLabel>>,
  pub(crate) withdraw_notify: Arc<Notify>,
}

impl UnitHandle {
  /// Returns the queue-assigned ID of this unit.
  pub fn id(&self) -> u64 {
    self.unit_id
  }

  /// Returns a clone of the labels associated with this unit.
  pub fn labels(&self) -> HashSet<UnitLabel> {
    (*self.labels).clone()
  }

  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Withdraws the unit if the queue has not started it yet. The queue
  /// resolves it as cancelled right away, even while every slot is busy. A
  /// unit that already started is unaffected and still has to signal
  /// completion.
  pub fn cancel(&self) {
    tracing::debug!(unit_id = %self.unit_id, "UnitHandle: Cancellation requested.");
    self.cancellation_token.cancel();
    self.withdraw_notify.notify_one();
  }

  /// Waits until the queue has released the unit's slot.
  ///
  /// # Errors
  /// Returns `UnitError::UnitPanicked`, `UnitError::WatchdogExpired` or
  /// `UnitError::ExecutorUnavailable` when the unit was finished on its
  /// behalf, `UnitError::UnitCancelled` if it was withdrawn before starting,
  /// `UnitError::QueueShuttingDown` if the queue discarded it during
  /// shutdown, `UnitError::ResultChannelError` if the queue went away without
  /// reporting, and `UnitError::ResultUnavailable` if the result was already
  /// taken.
  pub async fn await_completion(&mut self) -> Result<(), UnitError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(outcome) => outcome,
        Err(recv_error) => {
          tracing::warn!(unit_id = %self.unit_id, "Result channel receive error: {}", recv_error);
          Err(UnitError::ResultChannelError(format!(
            "Unit (id: {}) result channel unexpectedly closed: {}",
            self.unit_id, recv_error
          )))
        }
      },
      None => Err(UnitError::ResultUnavailable),
    }
  }
}
