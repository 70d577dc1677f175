use unit_orchestra::{BoundedUnitQueue, MainThreadExecutor, MainThreadUnit, ShutdownMode, UnitCompletionInfo};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Main-Thread Units Example (Limit: 3) ---");

  let ui_thread = MainThreadExecutor::spawn("ui-thread").expect("failed to spawn ui thread");
  let queue = BoundedUnitQueue::new(3, 10, Handle::current(), "ui_refresh");
  queue.add_completion_handler(|info: UnitCompletionInfo| {
    info!("Notifier: unit {} {:?} (labels {:?})", info.unit_id, info.status, info.labels);
  });

  let mut handles = Vec::new();
  for i in 0..6 {
    let unit = Arc::new(MainThreadUnit::new(ui_thread.clone()));
    let finish = unit.finish_signal();
    let runtime = Handle::current();
    let ui = ui_thread.clone();
    unit
      .set_body(move || {
        info!("Refresh {} runs on ui thread: {}", i, ui.is_current());
        runtime.spawn(async move {
          tokio::time::sleep(Duration::from_millis(300)).await;
          info!("Refresh {} data loaded.", i);
          let _ = finish.signal();
        });
      })
      .expect("body is attached before submission");
    handles.push(
      queue
        .submit(HashSet::from([format!("refresh-{}", i)]), unit)
        .await
        .expect("submit failed"),
    );
  }

  for mut handle in handles {
    if let Err(e) = handle.await_completion().await {
      tracing::error!("Unit {} failed: {:?}", handle.id(), e);
    }
  }

  queue
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Queue shutdown failed");
  ui_thread.shutdown();
  info!("--- Main-Thread Units Example End ---");
}
