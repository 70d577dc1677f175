use crate::error::UnitError;
use crate::unit::ManagedUnitInternal;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A queued unit together with the capacity permit it holds.
///
/// The permit is released when the message is dropped, which happens as soon
/// as the dispatch loop has taken the unit out of the channel. A capacity slot
/// is therefore only freed once a unit has been fully dequeued.
pub(crate) struct QueueMessage {
  pub(crate) unit: ManagedUnitInternal,
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("unit_id", &self.unit.unit_id)
      .finish_non_exhaustive()
  }
}

/// A bounded multi-producer, single-consumer FIFO of submitted units.
///
/// Capacity is enforced by a semaphore in front of an unbounded
/// `fibre::mpsc` channel, which gives `submit` backpressure without a lock in
/// the hot path.
#[derive(Debug)]
pub(crate) struct UnitQueue {
  tx: AsyncSender<QueueMessage>,
  rx: AsyncReceiver<QueueMessage>,
  gate: Arc<Semaphore>,
}

impl UnitQueue {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      tx,
      rx,
      gate: Arc::new(Semaphore::new(capacity.max(1))),
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        tx: self.tx,
        gate: self.gate,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// Producer half; cloned into every submission site.
#[derive(Clone)]
pub(crate) struct QueueProducer {
  tx: AsyncSender<QueueMessage>,
  gate: Arc<Semaphore>,
}

/// Consumer half. Not cloneable: the dispatch loop is the only reader, which
/// keeps start order equal to submission order.
#[derive(Debug)]
pub(crate) struct QueueConsumer {
  rx: AsyncReceiver<QueueMessage>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("gate_permits", &self.gate.available_permits())
      .finish_non_exhaustive()
  }
}

impl QueueProducer {
  /// Enqueues a unit, waiting for capacity if the queue is full.
  ///
  /// # Errors
  /// `UnitError::QueueShuttingDown` if shutdown starts before or while
  /// waiting; `UnitError::QueueSendChannelClosed` if the consumer is gone.
  pub(crate) async fn send(
    &self,
    unit: ManagedUnitInternal,
    shutdown_token: &CancellationToken,
  ) -> Result<(), UnitError> {
    if shutdown_token.is_cancelled() || self.tx.is_closed() {
      return Err(UnitError::QueueShuttingDown);
    }

    let permit = tokio::select! {
      biased;
      _ = shutdown_token.cancelled() => return Err(UnitError::QueueShuttingDown),
      acquired = self.gate.clone().acquire_owned() => match acquired {
        Ok(permit) => permit,
        Err(_) => return Err(UnitError::QueueShuttingDown),
      },
    };

    // On a failed send the message, and with it the permit, is dropped here.
    self
      .tx
      .send(QueueMessage { unit, _permit: permit })
      .await
      .map_err(|_| UnitError::QueueSendChannelClosed)
  }

  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Number of units waiting in the channel.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

impl QueueConsumer {
  /// Receives the next unit. The capacity permit travelling with it is
  /// released on return.
  pub(crate) async fn recv(&self) -> Result<ManagedUnitInternal, RecvError> {
    match self.rx.recv().await {
      Ok(message) => Ok(message.unit),
      Err(e) => Err(e),
    }
  }
}
