use crate::error::UnitError;
use crate::lifecycle::{FinishReason, FinishSignal, UnitLifecycle};
use crate::unit::{run_body, AsyncUnit, UnitCore};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// A job accepted by the [`MainThreadExecutor`].
pub type MainThreadJob = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorInner {
  name: Arc<String>,
  thread_id: ThreadId,
  job_tx: Mutex<Option<mpsc::UnboundedSender<MainThreadJob>>>,
  join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A single dedicated thread that runs submitted jobs one at a time, in
/// submission order.
///
/// Stands in for a UI/main thread: everything dispatched here executes on the
/// same OS thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct MainThreadExecutor {
  inner: Arc<ExecutorInner>,
}

impl fmt::Debug for MainThreadExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MainThreadExecutor")
      .field("name", &self.inner.name)
      .field("thread_id", &self.inner.thread_id)
      .field("accepting", &self.inner.job_tx.lock().is_some())
      .finish()
  }
}

impl MainThreadExecutor {
  /// Spawns the executor thread.
  ///
  /// # Errors
  /// Returns `UnitError::ExecutorSpawn` if the OS refuses to create the thread.
  pub fn spawn(name: &str) -> Result<Self, UnitError> {
    let (job_tx, job_rx) = mpsc::unbounded_channel::<MainThreadJob>();
    let executor_name = Arc::new(name.to_string());
    let loop_name = executor_name.clone();

    let join_handle = thread::Builder::new()
      .name(name.to_string())
      .spawn(move || Self::run_job_loop(loop_name, job_rx))
      .map_err(|e| UnitError::ExecutorSpawn(e.to_string()))?;

    info!(executor = %name, "Main-thread executor started.");
    Ok(Self {
      inner: Arc::new(ExecutorInner {
        name: executor_name,
        thread_id: join_handle.thread().id(),
        job_tx: Mutex::new(Some(job_tx)),
        join_handle: Mutex::new(Some(join_handle)),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// The id of the thread every job runs on.
  pub fn thread_id(&self) -> ThreadId {
    self.inner.thread_id
  }

  /// Returns `true` when called from the executor thread.
  pub fn is_current(&self) -> bool {
    thread::current().id() == self.inner.thread_id
  }

  /// Queues a job without waiting for it to run.
  ///
  /// # Errors
  /// Returns `UnitError::ExecutorUnavailable` after `shutdown`.
  pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> Result<(), UnitError> {
    let guard = self.inner.job_tx.lock();
    match guard.as_ref() {
      Some(tx) => tx.send(Box::new(job)).map_err(|_| UnitError::ExecutorUnavailable),
      None => Err(UnitError::ExecutorUnavailable),
    }
  }

  /// Stops accepting jobs, lets already queued jobs run, then joins the
  /// thread. Blocks the caller until the queue is drained. Called from the
  /// executor thread itself it only closes the queue.
  pub fn shutdown(&self) {
    let closed_tx = self.inner.job_tx.lock().take();
    if closed_tx.is_none() {
      trace!(executor = %*self.inner.name, "Shutdown already performed.");
    }
    drop(closed_tx);

    if self.is_current() {
      debug!(executor = %*self.inner.name, "Shutdown requested from the executor thread; not joining.");
      return;
    }

    let handle = self.inner.join_handle.lock().take();
    if let Some(handle) = handle {
      if handle.join().is_err() {
        error!(executor = %*self.inner.name, "Main-thread executor thread terminated abnormally.");
      } else {
        info!(executor = %*self.inner.name, "Main-thread executor stopped.");
      }
    }
  }

  fn run_job_loop(name: Arc<String>, mut job_rx: mpsc::UnboundedReceiver<MainThreadJob>) {
    trace!(executor = %*name, "Job loop started.");
    while let Some(job) = job_rx.blocking_recv() {
      if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(executor = %*name, "A main-thread job panicked. Executor keeps running.");
      }
    }
    trace!(executor = %*name, "Job queue closed and drained. Job loop exiting.");
  }
}

/// An asynchronous unit whose body runs on a [`MainThreadExecutor`].
///
/// `start` only hands the body over; the bounded queue therefore counts the
/// unit as in flight while it waits for the executor and while whatever the
/// body kicked off is outstanding.
#[derive(Debug)]
pub struct MainThreadUnit {
  core: UnitCore,
  executor: MainThreadExecutor,
}

impl MainThreadUnit {
  pub fn new(executor: MainThreadExecutor) -> Self {
    Self {
      core: UnitCore::new(None),
      executor,
    }
  }

  pub fn with_body(executor: MainThreadExecutor, body: impl FnOnce() + Send + 'static) -> Self {
    Self {
      core: UnitCore::new(Some(Box::new(body))),
      executor,
    }
  }

  /// # Errors
  /// Returns `UnitError::AlreadyStarted` once the unit has been started.
  pub fn set_body(&self, body: impl FnOnce() + Send + 'static) -> Result<(), UnitError> {
    self.core.set_body(Box::new(body))
  }

  pub fn finish_signal(&self) -> FinishSignal {
    self.core.finish_signal()
  }

  pub fn executor(&self) -> &MainThreadExecutor {
    &self.executor
  }
}

impl AsyncUnit for MainThreadUnit {
  fn start(&self) {
    let body = match self.core.begin() {
      Ok(Some(body)) => body,
      Ok(None) => {
        debug!("Main-thread unit started without a body. Finishing immediately.");
        let _ = self.core.lifecycle().finish(FinishReason::NoBody);
        return;
      }
      Err(e) => {
        warn!("Ignoring start request: {}", e);
        return;
      }
    };

    let lifecycle = self.core.shared_lifecycle();
    if let Err(e) = self.executor.dispatch(move || run_body(&lifecycle, body)) {
      error!(executor = %self.executor.name(), "Could not hand unit body to executor: {}", e);
      let _ = self.core.lifecycle().finish(FinishReason::ExecutorUnavailable);
    }
  }

  fn lifecycle(&self) -> &UnitLifecycle {
    self.core.lifecycle()
  }
}
