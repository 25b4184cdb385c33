//! Subscriptions: reference-counted observation of cache entries.
//!
//! A [`QueryHandle`] is the live subscription a consumer holds while it
//! observes a query. Creating one increments the entry's subscriber count
//! (fetching if the entry is absent or stale) and dropping it decrements
//! the count; the last drop arms the eviction timer and stops polling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::entry::{QuerySnapshot, QueryStatus};
use crate::definition::QueryDefinition;
use crate::key::CacheKey;
use crate::runtime::RuntimeInner;

impl RuntimeInner {
  /// Register one subscriber for a query invocation, creating the entry
  /// and triggering a fetch as needed.
  pub(crate) fn subscribe(&self, def: &QueryDefinition, args: &Value) -> QueryHandle {
    let key = def.key(args);
    let ttl = def.ttl.unwrap_or_else(|| self.config.default_ttl());
    let poll_interval = def.poll_interval.or_else(|| self.config.default_poll_interval());
    let request = def.request(args);

    let (needs_fetch, watch) = {
      let mut store = self.store.lock().expect("cache lock poisoned");
      let entry = store.ensure_entry(&key, ttl, poll_interval, def.tags.clone(), request);
      entry.subscriber_count += 1;
      let first = entry.subscriber_count == 1;
      // Absent data and invalidated entries both read as stale; an
      // in-flight fetch is joined rather than duplicated.
      let needs_fetch = entry.in_flight.is_none() && entry.is_stale(Instant::now());
      let watch = entry.subscribe_watch();

      if first {
        if let Some(interval) = entry.poll_interval {
          self
            .polling
            .start(self.weak_self.clone(), key.clone(), interval);
        }
      }
      (needs_fetch, watch)
    };

    debug!(key = %key, endpoint = %def.endpoint_id, needs_fetch, "subscribed");
    if needs_fetch {
      self.start_fetch(&key);
    }

    QueryHandle {
      runtime: self
        .weak_self
        .upgrade()
        .expect("runtime inner is always owned by an Arc"),
      key,
      watch,
    }
  }

  pub(crate) fn unsubscribe(&self, key: &CacheKey) {
    let armed = {
      let mut store = self.store.lock().expect("cache lock poisoned");
      let Some(entry) = store.get_mut(key) else {
        return;
      };
      entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
      if entry.subscriber_count > 0 {
        None
      } else {
        entry.idle_epoch += 1;
        self.polling.stop(key);
        Some((entry.idle_epoch, entry.ttl))
      }
    };

    if let Some((epoch, ttl)) = armed {
      debug!(key = %key, ?ttl, "last subscriber gone, arming eviction timer");
      self.arm_eviction(key, epoch, ttl);
    }
  }

  /// Schedule `evict_if_idle` to run `ttl` from now.
  pub(crate) fn arm_eviction(&self, key: &CacheKey, epoch: u64, ttl: Duration) {
    let weak = self.weak_self.clone();
    let key = key.clone();
    // Outside a runtime there is nothing to arm a timer on; the entry
    // lingers until the process exits.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(inner) = weak.upgrade() {
          inner.evict_if_idle(&key, epoch);
        }
      });
    } else {
      warn!(key = %key, "no async runtime available, skipping eviction timer");
    }
  }

  /// Fires `ttl` after a subscriber count hit zero. Evicts only if the
  /// entry is still in the same idle period, still unobserved, and has no
  /// fetch outstanding; a subscription in the interim makes this a no-op,
  /// and an in-flight fetch re-arms the timer when it lands.
  pub(crate) fn evict_if_idle(&self, key: &CacheKey, epoch: u64) {
    let mut store = self.store.lock().expect("cache lock poisoned");
    let evict = store
      .get(key)
      .map(|e| e.subscriber_count == 0 && e.idle_epoch == epoch && e.in_flight.is_none())
      .unwrap_or(false);
    if evict {
      debug!(key = %key, "evicting idle entry");
      store.remove(key);
    }
  }
}

/// Live subscription to one query. Unsubscribes on drop.
pub struct QueryHandle {
  runtime: Arc<RuntimeInner>,
  key: CacheKey,
  watch: watch::Receiver<u64>,
}

impl QueryHandle {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Current view of the entry. Stale data is returned as-is; freshness
  /// is reconciled by background fetches, never by withholding data.
  pub fn snapshot(&self) -> QuerySnapshot {
    let store = self.runtime.store.lock().expect("cache lock poisoned");
    match store.get(&self.key) {
      Some(entry) => entry.snapshot(Instant::now()),
      // Subscribed entries are not evictable, so this only happens if
      // the entry was never created; present an idle view.
      None => QuerySnapshot {
        status: QueryStatus::Idle,
        data: None,
        error: None,
        fetched_at: None,
        is_stale: true,
      },
    }
  }

  /// Force a refetch. Joins the in-flight fetch if one is outstanding.
  pub fn refetch(&self) {
    {
      let mut store = self.runtime.store.lock().expect("cache lock poisoned");
      if let Some(entry) = store.get_mut(&self.key) {
        entry.fetched_at = None;
      }
    }
    self.runtime.start_fetch(&self.key);
  }

  /// Wait for the next change to the entry. Returns `false` if the entry
  /// is gone and no further changes can arrive.
  pub async fn changed(&mut self) -> bool {
    self.watch.changed().await.is_ok()
  }

  /// Wait until the entry is neither idle nor loading, then snapshot it.
  pub async fn settled(&mut self) -> QuerySnapshot {
    loop {
      let snapshot = self.snapshot();
      if !matches!(snapshot.status, QueryStatus::Idle | QueryStatus::Loading) {
        return snapshot;
      }
      if !self.changed().await {
        return self.snapshot();
      }
    }
  }
}

impl Drop for QueryHandle {
  fn drop(&mut self) {
    self.runtime.unsubscribe(&self.key);
  }
}

impl std::fmt::Debug for QueryHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}
