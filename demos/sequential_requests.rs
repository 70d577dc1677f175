use unit_orchestra::{BoundedUnitQueue, ShutdownMode, SignaledUnit, UnitHandle};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

// Stand-in for a callback-based client: returns at once and invokes
// `on_done` from another task once the "response" arrives.
fn fetch_with_callback(name: &'static str, latency: Duration, on_done: impl FnOnce(String) + Send + 'static) {
  tokio::spawn(async move {
    tokio::time::sleep(latency).await;
    on_done(format!("{} response", name));
  });
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Sequential Requests Example (Limit: 1) ---");

  let queue = BoundedUnitQueue::new(1, 10, Handle::current(), "sequential_requests");
  let started = Instant::now();
  let mut handles: Vec<UnitHandle> = Vec::new();

  for name in ["op1", "op2", "op3"] {
    let unit = Arc::new(SignaledUnit::new());
    let finish = unit.finish_signal();
    unit
      .set_body(move || {
        info!("{} started at {:?}", name, started.elapsed());
        fetch_with_callback(name, Duration::from_secs(1), move |response| {
          info!("{} received '{}'", name, response);
          let _ = finish.signal();
        });
      })
      .expect("body is attached before submission");

    match queue.submit(HashSet::from([name.to_string()]), unit).await {
      Ok(handle) => handles.push(handle),
      Err(e) => tracing::error!("Failed to submit {}: {:?}", name, e),
    }
  }

  for mut handle in handles {
    let unit_id = handle.id();
    match handle.await_completion().await {
      Ok(()) => info!("Unit {} released its slot.", unit_id),
      Err(e) => info!("Unit {} ended with error: {:?}", unit_id, e),
    }
  }

  info!("All units done after {:?} (expected ~3s). Shutting down.", started.elapsed());
  queue
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Queue shutdown failed");
  info!("--- Sequential Requests Example End ---");
}
