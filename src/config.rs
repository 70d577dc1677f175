use std::time::Duration;

use tokio::sync::Semaphore;

/// Graceful shutdown reclaims every slot with a single `acquire_many`,
/// which counts in `u32`.
const MAX_CONCURRENCY_LIMIT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
  Semaphore::MAX_PERMITS
} else {
  u32::MAX as usize
};

/// Tuning knobs for a [`BoundedUnitQueue`](crate::BoundedUnitQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
  /// How many units may be in flight (started but not finished) at once.
  pub concurrency_limit: usize,
  /// How many submitted units may wait for a slot before `submit` applies
  /// backpressure.
  pub queue_capacity: usize,
  /// If set, a unit that has not finished this long after `start` is
  /// finished by the queue with `FinishReason::WatchdogExpired`.
  pub watchdog: Option<Duration>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      concurrency_limit: 1,
      queue_capacity: 64,
      watchdog: None,
    }
  }
}

impl QueueConfig {
  pub fn new(concurrency_limit: usize, queue_capacity: usize) -> Self {
    Self {
      concurrency_limit,
      queue_capacity,
      watchdog: None,
    }
  }

  pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
    self.watchdog = Some(watchdog);
    self
  }

  /// Limits are clamped to at least one and to what the underlying
  /// semaphores can hold, so `usize::MAX` works as "unbounded".
  pub(crate) fn normalized(mut self) -> Self {
    self.concurrency_limit = self.concurrency_limit.clamp(1, MAX_CONCURRENCY_LIMIT);
    self.queue_capacity = self.queue_capacity.clamp(1, Semaphore::MAX_PERMITS);
    self
  }
}
