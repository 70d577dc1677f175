use thiserror::Error;

/// Errors that can occur within the `unit_orchestra` queue and its units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
  #[error("Unit was signaled finished before it was started")]
  NotStarted,

  #[error("Unit has already been started")]
  AlreadyStarted,

  #[error("Unit was released before it could be signaled")]
  UnitReleased,

  #[error("Unit body panicked before signaling completion")]
  UnitPanicked,

  #[error("Unit was cancelled before it started")]
  UnitCancelled,

  #[error("Unit did not signal completion before the watchdog expired")]
  WatchdogExpired,

  #[error("Main-thread executor is shut down and cannot accept work")]
  ExecutorUnavailable,

  #[error("Failed to spawn main-thread executor: {0}")]
  ExecutorSpawn(String),

  #[error("Unit result channel error (unit was discarded or receiver dropped): {0}")]
  ResultChannelError(String),

  #[error("Unit result already taken or channel was not available")]
  ResultUnavailable,

  #[error("Queue's internal unit channel (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Queue is shutting down or already shut down, cannot accept new units")]
  QueueShuttingDown,
}
