//! Interval-driven refetching for subscribed queries.
//!
//! One task per actively polled key, started on the 0→1 subscriber
//! transition and aborted on 1→0 — polling is driven purely by
//! subscription state, never by consumer lifecycle hooks. A tick that
//! fires while a fetch is already outstanding joins it through the
//! store's single-flight bookkeeping, so overlapping polls cost nothing.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::key::CacheKey;
use crate::runtime::RuntimeInner;

pub(crate) struct PollingScheduler {
  tasks: Mutex<HashMap<CacheKey, JoinHandle<()>>>,
}

impl PollingScheduler {
  pub fn new() -> Self {
    Self {
      tasks: Mutex::new(HashMap::new()),
    }
  }

  /// Begin polling a key. No-op if a poll task already exists.
  pub fn start(&self, runtime: Weak<RuntimeInner>, key: CacheKey, interval: Duration) {
    let mut tasks = self.tasks.lock().unwrap();
    if tasks.contains_key(&key) {
      return;
    }

    debug!(key = %key, ?interval, "starting poll task");
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately; the subscription itself
      // already fetched.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match runtime.upgrade() {
          Some(inner) => {
            inner.start_fetch(&task_key);
          }
          None => break,
        }
      }
    });
    tasks.insert(key, handle);
  }

  /// Stop polling a key, if it was being polled.
  pub fn stop(&self, key: &CacheKey) {
    if let Some(handle) = self.tasks.lock().unwrap().remove(key) {
      debug!(key = %key, "stopping poll task");
      handle.abort();
    }
  }

  pub fn active_count(&self) -> usize {
    self.tasks.lock().unwrap().len()
  }
}

impl Drop for PollingScheduler {
  fn drop(&mut self) {
    for handle in self.tasks.lock().unwrap().values() {
      handle.abort();
    }
  }
}
