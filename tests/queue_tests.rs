use unit_orchestra::{
  AsyncUnit, BoundedUnitQueue, FinishReason, QueueConfig, ShutdownMode, SignaledUnit, UnitError, UnitHandle,
  UnitLifecycle, UnitState,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;

// Helper to initialize tracing for tests (Once ensures it runs once per binary)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,unit_orchestra=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Helper: a unit whose body hands off to a simulated async delegate that
// signals completion after `delay`.
fn delayed_unit(delay: Duration, on_start: impl FnOnce() + Send + 'static) -> Arc<SignaledUnit> {
  let unit = Arc::new(SignaledUnit::new());
  let finish = unit.finish_signal();
  unit
    .set_body(move || {
      on_start();
      tokio::spawn(async move {
        sleep(delay).await;
        finish.signal().expect("unit should be running when its delegate completes");
      });
    })
    .unwrap();
  unit
}

// Helper: a unit that only finishes when the test says so.
fn manual_unit(started_flag: Arc<AtomicBool>) -> (Arc<SignaledUnit>, tokio::sync::oneshot::Sender<()>) {
  let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
  let unit = Arc::new(SignaledUnit::new());
  let finish = unit.finish_signal();
  unit
    .set_body(move || {
      started_flag.store(true, Ordering::SeqCst);
      tokio::spawn(async move {
        let _ = release_rx.await;
        let _ = finish.signal();
      });
    })
    .unwrap();
  (unit, release_tx)
}

async fn await_all(handles: Vec<UnitHandle>) -> Vec<Result<(), UnitError>> {
  let mut results = Vec::new();
  for mut handle in handles {
    results.push(handle.await_completion().await);
  }
  results
}

#[tokio::test]
async fn test_submit_and_await_basic_unit() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(2, 5, TokioHandle::current(), "test_queue_basic_submit");

  let ran = Arc::new(AtomicBool::new(false));
  let ran_in_body = ran.clone();
  let unit = delayed_unit(Duration::from_millis(30), move || ran_in_body.store(true, Ordering::SeqCst));
  let mut handle = queue.submit(HashSet::new(), unit.clone()).await.unwrap();

  assert_eq!(handle.await_completion().await, Ok(()));
  assert!(ran.load(Ordering::SeqCst));
  assert_eq!(unit.lifecycle().state(), UnitState::Finished(FinishReason::Signaled));
  assert_eq!(queue.active_unit_count(), 0);

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_serial_queue_waits_for_each_finish_signal() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 10, TokioHandle::current(), "test_queue_serial");
  let delay = Duration::from_millis(100);
  let started_at: Arc<Mutex<Vec<(String, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

  let test_start = Instant::now();
  let mut handles = Vec::new();
  for label in ["op1", "op2", "op3"] {
    let log = started_at.clone();
    let unit = delayed_unit(delay, move || {
      tracing::info!("{}", label);
      log.lock().unwrap().push((label.to_string(), Instant::now()));
    });
    handles.push(queue.submit(HashSet::from([label.to_string()]), unit).await.unwrap());
  }

  let results = await_all(handles).await;
  assert!(results.iter().all(Result::is_ok), "unexpected results: {:?}", results);
  assert!(test_start.elapsed() >= delay * 3);

  let log = started_at.lock().unwrap().clone();
  let labels: Vec<&str> = log.iter().map(|(label, _)| label.as_str()).collect();
  assert_eq!(labels, vec!["op1", "op2", "op3"]);
  for pair in log.windows(2) {
    let gap = pair[1].1.duration_since(pair[0].1);
    assert!(gap >= delay, "{} started only {:?} after {}", pair[1].0, gap, pair[0].0);
  }

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_never_exceeded() {
  setup_tracing_for_test();
  let limit = 3;
  let unit_count = 12;
  let queue = BoundedUnitQueue::new(limit, unit_count, TokioHandle::current(), "test_queue_limit");

  let delays: Vec<u64> = {
    let mut rng = rand::rng();
    (0..unit_count).map(|_| rng.random_range(10..60)).collect()
  };

  let running = Arc::new(AtomicUsize::new(0));
  let max_running = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();

  for delay_ms in delays {
    let unit = Arc::new(SignaledUnit::new());
    let finish = unit.finish_signal();
    let running = running.clone();
    let max_running = max_running.clone();
    unit
      .set_body(move || {
        let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
        max_running.fetch_max(now_running, Ordering::SeqCst);
        tokio::spawn(async move {
          sleep(Duration::from_millis(delay_ms)).await;
          running.fetch_sub(1, Ordering::SeqCst);
          finish.signal().unwrap();
        });
      })
      .unwrap();
    handles.push(queue.submit(HashSet::new(), unit).await.unwrap());
    assert!(queue.active_unit_count() <= limit);
  }

  let results = await_all(handles).await;
  assert!(results.iter().all(Result::is_ok));
  assert_eq!(max_running.load(Ordering::SeqCst), limit);
  assert_eq!(running.load(Ordering::SeqCst), 0);

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_start_returning_does_not_free_the_slot() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_start_not_completion");

  let first_started = Arc::new(AtomicBool::new(false));
  let second_started = Arc::new(AtomicBool::new(false));
  let (first, release_first) = manual_unit(first_started.clone());
  let (second, release_second) = manual_unit(second_started.clone());

  let mut first_handle = queue.submit(HashSet::new(), first.clone()).await.unwrap();
  let mut second_handle = queue.submit(HashSet::new(), second.clone()).await.unwrap();

  sleep(Duration::from_millis(50)).await;
  assert!(first_started.load(Ordering::SeqCst));
  assert!(first.is_running());
  assert!(!first.is_finished());
  assert!(!second_started.load(Ordering::SeqCst), "second unit started while the first still held the slot");
  assert_eq!(queue.active_unit_count(), 1);
  assert_eq!(queue.queued_unit_count(), 1);

  release_first.send(()).unwrap();
  assert_eq!(first_handle.await_completion().await, Ok(()));

  sleep(Duration::from_millis(50)).await;
  assert!(second_started.load(Ordering::SeqCst));
  release_second.send(()).unwrap();
  assert_eq!(second_handle.await_completion().await, Ok(()));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_units_may_finish_out_of_order() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(2, 5, TokioHandle::current(), "test_queue_out_of_order");
  let finished_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

  let mut handles = Vec::new();
  for (label, delay_ms) in [("slow", 200u64), ("fast", 20u64)] {
    let unit = Arc::new(SignaledUnit::new());
    let finish = unit.finish_signal();
    let order = finished_order.clone();
    unit
      .set_body(move || {
        tokio::spawn(async move {
          sleep(Duration::from_millis(delay_ms)).await;
          order.lock().unwrap().push(label);
          finish.signal().unwrap();
        });
      })
      .unwrap();
    handles.push(queue.submit(HashSet::new(), unit).await.unwrap());
  }

  await_all(handles).await;
  assert_eq!(*finished_order.lock().unwrap(), vec!["fast", "slow"]);

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_unit_without_body_completes() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_no_body");

  let unit = Arc::new(SignaledUnit::new());
  let mut handle = queue.submit(HashSet::new(), unit.clone()).await.unwrap();
  assert_eq!(handle.await_completion().await, Ok(()));
  assert_eq!(unit.lifecycle().state(), UnitState::Finished(FinishReason::NoBody));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_panicking_body_releases_its_slot() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_panic");

  let panicking = Arc::new(SignaledUnit::with_body(|| panic!("unit body intentionally panicked")));
  let mut panic_handle = queue.submit(HashSet::new(), panicking.clone()).await.unwrap();

  let follow_up = delayed_unit(Duration::from_millis(10), || {});
  let mut follow_up_handle = queue.submit(HashSet::new(), follow_up).await.unwrap();

  assert_eq!(panic_handle.await_completion().await, Err(UnitError::UnitPanicked));
  assert_eq!(
    panicking.lifecycle().state(),
    UnitState::Finished(FinishReason::BodyPanicked)
  );
  assert_eq!(follow_up_handle.await_completion().await, Ok(()));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_unit_via_handle() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_cancel_handle");

  let blocker_started = Arc::new(AtomicBool::new(false));
  let (blocker, release_blocker) = manual_unit(blocker_started.clone());
  let mut blocker_handle = queue.submit(HashSet::new(), blocker).await.unwrap();

  let cancelled_started = Arc::new(AtomicBool::new(false));
  let (cancelled, _release_cancelled) = manual_unit(cancelled_started.clone());
  let mut cancelled_handle = queue.submit(HashSet::new(), cancelled.clone()).await.unwrap();

  sleep(Duration::from_millis(30)).await;
  cancelled_handle.cancel();
  assert!(cancelled_handle.is_cancellation_requested());

  release_blocker.send(()).unwrap();
  assert_eq!(blocker_handle.await_completion().await, Ok(()));
  assert_eq!(cancelled_handle.await_completion().await, Err(UnitError::UnitCancelled));
  assert!(!cancelled_started.load(Ordering::SeqCst));
  assert_eq!(cancelled.lifecycle().state(), UnitState::Pending);

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_units_by_label() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 10, TokioHandle::current(), "test_queue_cancel_label");

  let blocker_started = Arc::new(AtomicBool::new(false));
  let (blocker, release_blocker) = manual_unit(blocker_started.clone());
  let mut blocker_handle = queue
    .submit(HashSet::from(["network".to_string()]), blocker)
    .await
    .unwrap();

  let mut network_handle = queue
    .submit(HashSet::from(["network".to_string()]), delayed_unit(Duration::from_millis(10), || {}))
    .await
    .unwrap();
  let mut other_handle = queue
    .submit(HashSet::from(["disk".to_string()]), delayed_unit(Duration::from_millis(10), || {}))
    .await
    .unwrap();

  sleep(Duration::from_millis(30)).await;
  assert!(blocker_started.load(Ordering::SeqCst));
  queue.cancel_units_by_label(&"network".to_string());

  release_blocker.send(()).unwrap();
  assert_eq!(blocker_handle.await_completion().await, Ok(()), "started unit must not be cancelled");
  assert_eq!(network_handle.await_completion().await, Err(UnitError::UnitCancelled));
  assert_eq!(other_handle.await_completion().await, Ok(()));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_cancel_resolves_while_blocker_still_running() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_cancel_busy");

  let blocker_started = Arc::new(AtomicBool::new(false));
  let (blocker, release_blocker) = manual_unit(blocker_started.clone());
  let mut blocker_handle = queue.submit(HashSet::new(), blocker.clone()).await.unwrap();

  let queued_started = Arc::new(AtomicBool::new(false));
  let (queued, _release_queued) = manual_unit(queued_started.clone());
  let mut queued_handle = queue.submit(HashSet::new(), queued).await.unwrap();

  sleep(Duration::from_millis(30)).await;
  assert!(blocker.is_running());
  assert_eq!(queue.queued_unit_count(), 1);

  queued_handle.cancel();
  let outcome = tokio::time::timeout(Duration::from_secs(1), queued_handle.await_completion())
    .await
    .expect("cancelled unit waited for the running blocker");
  assert_eq!(outcome, Err(UnitError::UnitCancelled));
  assert_eq!(queue.queued_unit_count(), 0);
  assert!(blocker.is_running(), "blocker must keep its slot");

  // The withdrawn message is skipped once the slot frees up.
  let mut next_handle = queue
    .submit(HashSet::new(), delayed_unit(Duration::from_millis(10), || {}))
    .await
    .unwrap();
  release_blocker.send(()).unwrap();
  assert_eq!(blocker_handle.await_completion().await, Ok(()));
  assert_eq!(next_handle.await_completion().await, Ok(()));
  assert!(!queued_started.load(Ordering::SeqCst));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_cancel_by_label_resolves_while_blocker_still_running() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_cancel_label_busy");

  let blocker_started = Arc::new(AtomicBool::new(false));
  let (blocker, release_blocker) = manual_unit(blocker_started.clone());
  let mut blocker_handle = queue.submit(HashSet::new(), blocker).await.unwrap();

  let mut handles = Vec::new();
  for _ in 0..2 {
    let handle = queue
      .submit(HashSet::from(["prefetch".to_string()]), delayed_unit(Duration::from_millis(10), || {}))
      .await
      .unwrap();
    handles.push(handle);
  }

  sleep(Duration::from_millis(30)).await;
  assert!(blocker_started.load(Ordering::SeqCst));
  queue.cancel_units_by_label(&"prefetch".to_string());

  let results = tokio::time::timeout(Duration::from_secs(1), await_all(handles))
    .await
    .expect("label-cancelled units waited for the running blocker");
  assert_eq!(results, vec![Err(UnitError::UnitCancelled), Err(UnitError::UnitCancelled)]);
  assert_eq!(queue.queued_unit_count(), 0);
  assert_eq!(queue.active_unit_count(), 1);

  release_blocker.send(()).unwrap();
  assert_eq!(blocker_handle.await_completion().await, Ok(()));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_unbounded_limits_are_accepted() {
  setup_tracing_for_test();
  let config = QueueConfig::new(usize::MAX, usize::MAX);
  let queue = BoundedUnitQueue::with_config(config, TokioHandle::current(), "test_queue_unbounded");
  assert!(queue.concurrency_limit() > 1_000_000);

  let mut handles = Vec::new();
  for _ in 0..5 {
    handles.push(
      queue
        .submit(HashSet::new(), delayed_unit(Duration::from_millis(50), || {}))
        .await
        .unwrap(),
    );
  }
  sleep(Duration::from_millis(20)).await;
  assert_eq!(queue.active_unit_count(), 5);

  let results = await_all(handles).await;
  assert!(results.iter().all(Result::is_ok));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_watchdog_finishes_silent_unit() {
  setup_tracing_for_test();
  let config = QueueConfig::new(1, 5).with_watchdog(Duration::from_millis(100));
  let queue = BoundedUnitQueue::with_config(config, TokioHandle::current(), "test_queue_watchdog");

  let silent = Arc::new(SignaledUnit::with_body(|| {}));
  let late_signal = silent.finish_signal();
  let mut silent_handle = queue.submit(HashSet::new(), silent.clone()).await.unwrap();
  let mut next_handle = queue
    .submit(HashSet::new(), delayed_unit(Duration::from_millis(10), || {}))
    .await
    .unwrap();

  assert_eq!(silent_handle.await_completion().await, Err(UnitError::WatchdogExpired));
  assert_eq!(
    silent.lifecycle().state(),
    UnitState::Finished(FinishReason::WatchdogExpired)
  );
  assert_eq!(late_signal.signal(), Ok(false));
  assert_eq!(next_handle.await_completion().await, Ok(()));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_watchdog_leaves_prompt_units_alone() {
  setup_tracing_for_test();
  let config = QueueConfig::new(2, 5).with_watchdog(Duration::from_millis(500));
  let queue = BoundedUnitQueue::with_config(config, TokioHandle::current(), "test_queue_watchdog_prompt");

  let unit = delayed_unit(Duration::from_millis(20), || {});
  let mut handle = queue.submit(HashSet::new(), unit.clone()).await.unwrap();
  assert_eq!(handle.await_completion().await, Ok(()));
  assert_eq!(unit.lifecycle().state(), UnitState::Finished(FinishReason::Signaled));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

struct InlineUnit {
  lifecycle: UnitLifecycle,
  runs: Arc<AtomicUsize>,
}

impl AsyncUnit for InlineUnit {
  fn start(&self) {
    if self.lifecycle.mark_running().is_ok() {
      self.runs.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn lifecycle(&self) -> &UnitLifecycle {
    &self.lifecycle
  }

  fn is_asynchronous(&self) -> bool {
    false
  }
}

#[tokio::test]
async fn test_synchronous_unit_completes_when_start_returns() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_sync_unit");

  let runs = Arc::new(AtomicUsize::new(0));
  let unit = Arc::new(InlineUnit {
    lifecycle: UnitLifecycle::new(),
    runs: runs.clone(),
  });
  let mut handle = queue.submit(HashSet::new(), unit.clone()).await.unwrap();

  assert_eq!(handle.await_completion().await, Ok(()));
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert!(unit.is_finished());
  assert!(!unit.is_running());

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_result_can_only_be_taken_once() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_result_once");

  let mut handle = queue.submit(HashSet::new(), Arc::new(SignaledUnit::new())).await.unwrap();
  assert_eq!(handle.await_completion().await, Ok(()));
  assert_eq!(handle.await_completion().await, Err(UnitError::ResultUnavailable));

  queue.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_started_units() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(2, 5, TokioHandle::current(), "test_queue_shutdown_graceful");

  let first_done = Arc::new(AtomicBool::new(false));
  let second_done = Arc::new(AtomicBool::new(false));
  let queued_started = Arc::new(AtomicBool::new(false));

  let mut handles = Vec::new();
  for done in [first_done.clone(), second_done.clone()] {
    let unit = Arc::new(SignaledUnit::new());
    let finish = unit.finish_signal();
    unit
      .set_body(move || {
        tokio::spawn(async move {
          sleep(Duration::from_millis(200)).await;
          done.store(true, Ordering::SeqCst);
          finish.signal().unwrap();
        });
      })
      .unwrap();
    handles.push(queue.submit(HashSet::new(), unit).await.unwrap());
  }
  let (queued, _release_queued) = manual_unit(queued_started.clone());
  let mut queued_handle = queue.submit(HashSet::new(), queued).await.unwrap();

  sleep(Duration::from_millis(50)).await;
  assert_eq!(queue.active_unit_count(), 2);
  assert_eq!(queue.queued_unit_count(), 1);

  let shutdown_started = Instant::now();
  queue.clone().shutdown(ShutdownMode::Graceful).await.unwrap();
  assert!(shutdown_started.elapsed() >= Duration::from_millis(100));

  assert!(first_done.load(Ordering::SeqCst));
  assert!(second_done.load(Ordering::SeqCst));
  assert!(!queued_started.load(Ordering::SeqCst));
  assert_eq!(queue.active_unit_count(), 0);

  let results = await_all(handles).await;
  assert_eq!(results, vec![Ok(()), Ok(())]);
  assert_eq!(queued_handle.await_completion().await, Err(UnitError::QueueShuttingDown));
}

#[tokio::test]
async fn test_immediate_shutdown_does_not_wait_for_started_units() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_shutdown_immediate");

  let started = Arc::new(AtomicBool::new(false));
  let (unit, release) = manual_unit(started.clone());
  let mut handle = queue.submit(HashSet::new(), unit.clone()).await.unwrap();
  sleep(Duration::from_millis(30)).await;
  assert!(started.load(Ordering::SeqCst));

  tokio::time::timeout(Duration::from_secs(1), queue.clone().shutdown(ShutdownMode::Immediate))
    .await
    .expect("immediate shutdown waited for an unfinished unit")
    .unwrap();
  assert!(unit.is_running());

  release.send(()).unwrap();
  assert_eq!(handle.await_completion().await, Ok(()));
  assert!(unit.is_finished());
}

#[tokio::test]
async fn test_submit_after_shutdown_fails() {
  setup_tracing_for_test();
  let queue = BoundedUnitQueue::new(1, 5, TokioHandle::current(), "test_queue_submit_after_shutdown");
  queue.clone().shutdown(ShutdownMode::Graceful).await.unwrap();

  assert!(queue.is_shutting_down());
  let result = queue.submit(HashSet::new(), Arc::new(SignaledUnit::new())).await;
  assert!(matches!(result, Err(UnitError::QueueShuttingDown)));
}
