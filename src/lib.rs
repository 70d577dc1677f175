//! A Tokio-based bounded queue for units of work that report their own
//! completion.
//!
//! A unit's `start` may hand work to a callback-based operation and return
//! at once; the queue keeps the unit's concurrency slot occupied until the
//! unit signals it is finished. [`MainThreadUnit`] runs its body on a single
//! dedicated [`MainThreadExecutor`] thread under the same contract.

mod config;
mod error;
mod handle;
mod lifecycle;
mod main_thread;
mod manager;
mod notifier;
mod unit;
mod unit_queue;

pub use config::QueueConfig;
pub use error::UnitError;
pub use handle::UnitHandle;
pub use lifecycle::{FinishReason, FinishSignal, UnitLifecycle, UnitState, UnitWatcher};
pub use main_thread::{MainThreadExecutor, MainThreadJob, MainThreadUnit};
pub use manager::{BoundedUnitQueue, ShutdownMode};
pub use notifier::{UnitCompletionInfo, UnitCompletionStatus};
pub use unit::{AsyncUnit, SignaledUnit, UnitBody, UnitLabel};
