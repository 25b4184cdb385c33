//! The cache runtime: one explicit object wiring the store, the request
//! executor, the auth refresh gate, subscriptions, polling, and optimistic
//! updates together.
//!
//! Constructed once at application start and passed by reference to every
//! consumer; there is no global singleton. All entry/index/count
//! transitions happen synchronously under one lock, which is never held
//! across an await — suspension only occurs at network call boundaries,
//! so each locked section is an atomic step in the sense of the cache's
//! ordering guarantees.

use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{AuthRefreshGate, RefreshFn, TokenStore};
use crate::cache::entry::{QueryStatus, SharedFetch};
use crate::cache::optimistic::{OptimisticUpdate, OptimisticUpdateManager};
use crate::cache::store::CacheStore;
use crate::config::RuntimeConfig;
use crate::definition::{MutationDefinition, QueryDefinition};
use crate::error::FetchError;
use crate::executor::RequestExecutor;
use crate::key::{CacheKey, Tag};
use crate::polling::PollingScheduler;
use crate::subscription::QueryHandle;
use crate::transport::Transport;

/// Counters for debugging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
  pub entries: usize,
  pub subscriptions: usize,
  pub tags: usize,
  pub polled: usize,
}

pub(crate) struct RuntimeInner {
  pub(crate) weak_self: Weak<RuntimeInner>,
  pub(crate) store: Mutex<CacheStore>,
  pub(crate) executor: RequestExecutor,
  pub(crate) gate: AuthRefreshGate,
  pub(crate) tokens: Arc<dyn TokenStore>,
  pub(crate) optimistic: OptimisticUpdateManager,
  pub(crate) polling: PollingScheduler,
  pub(crate) config: RuntimeConfig,
}

impl RuntimeInner {
  /// Start a fetch for a key, or join the one already in flight.
  ///
  /// Single-flight: at most one outstanding network call per key. The
  /// result is applied to the store even if every subscriber disappears
  /// mid-flight, so a subscriber that reappears sees it.
  pub(crate) fn start_fetch(&self, key: &CacheKey) -> Option<SharedFetch> {
    let mut store = self.store.lock().expect("cache lock poisoned");
    let entry = store.get_mut(key)?;
    if let Some(in_flight) = &entry.in_flight {
      return Some(in_flight.clone());
    }
    let Some(request) = entry.request.clone() else {
      warn!(key = %key, "entry has no request template, cannot fetch");
      return None;
    };

    entry.status = QueryStatus::Loading;
    entry.touch();

    let runtime = self.weak_self.clone();
    let fetch_key = key.clone();
    let fetch: SharedFetch = async move {
      let Some(inner) = runtime.upgrade() else {
        return Err(FetchError::Network("runtime shut down".to_string()));
      };
      let result = inner.gate.execute(&inner.executor, &request).await;
      inner.complete_fetch(&fetch_key, &result);
      result
    }
    .boxed()
    .shared();

    entry.in_flight = Some(fetch.clone());
    drop(store);

    // Drive the fetch to completion independently of any subscriber.
    let driver = fetch.clone();
    tokio::spawn(async move {
      let _ = driver.await;
    });

    Some(fetch)
  }

  /// Apply a completed fetch to the store.
  ///
  /// The result is applied even when every subscriber is gone; an
  /// unobserved entry then becomes eligible for eviction, with a fresh
  /// timer counted from the fetch landing.
  fn complete_fetch(&self, key: &CacheKey, result: &Result<Value, FetchError>) {
    let armed = {
      let mut store = self.store.lock().expect("cache lock poisoned");
      let Some(entry) = store.get_mut(key) else {
        // Evicted mid-flight; nothing to apply.
        return;
      };
      entry.in_flight = None;
      match result {
        Ok(data) => {
          entry.status = QueryStatus::Success;
          entry.data = Some(data.clone());
          entry.error = None;
          entry.fetched_at = Some(tokio::time::Instant::now());
          entry.fetched_at_utc = Some(chrono::Utc::now());
        }
        Err(e) => {
          // A failed refetch never clears cached data; the entry keeps
          // serving the last good value with the error as metadata.
          entry.status = QueryStatus::Error;
          entry.error = Some(e.clone());
          debug!(key = %key, error = %e, "fetch failed");
        }
      }
      entry.touch();
      if entry.subscriber_count == 0 {
        entry.idle_epoch += 1;
        Some((entry.idle_epoch, entry.ttl))
      } else {
        None
      }
    };
    if let Some((epoch, ttl)) = armed {
      self.arm_eviction(key, epoch, ttl);
    }
  }

  /// Mark every entry tagged with any of `tags` stale; refetch the
  /// subscribed ones immediately and leave the rest for their next
  /// subscription.
  pub(crate) fn invalidate_tags(&self, tags: &[Tag]) {
    if tags.is_empty() {
      return;
    }
    let refetch: Vec<CacheKey> = {
      let mut store = self.store.lock().expect("cache lock poisoned");
      store
        .mark_stale_by_tags(tags)
        .into_iter()
        .filter(|(_, subscribed)| *subscribed)
        .map(|(key, _)| key)
        .collect()
    };
    debug!(?tags, refetching = refetch.len(), "invalidated tags");
    for key in &refetch {
      self.start_fetch(key);
    }
  }
}

/// The application-wide cache runtime.
#[derive(Clone)]
pub struct CacheRuntime {
  inner: Arc<RuntimeInner>,
}

impl CacheRuntime {
  pub fn new(
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    refresh: RefreshFn,
  ) -> Self {
    let inner = Arc::new_cyclic(|weak| RuntimeInner {
      weak_self: weak.clone(),
      store: Mutex::new(CacheStore::new()),
      executor: RequestExecutor::new(transport, tokens.clone()),
      gate: AuthRefreshGate::new(tokens.clone(), refresh),
      tokens,
      optimistic: OptimisticUpdateManager::new(),
      polling: PollingScheduler::new(),
      config,
    });
    Self { inner }
  }

  /// Subscribe to a query. Fetches if the entry is absent or stale;
  /// otherwise the cached value is served as-is.
  pub fn query(&self, def: &QueryDefinition, args: Value) -> QueryHandle {
    self.inner.subscribe(def, &args)
  }

  /// Run a mutation with no speculative cache edits.
  pub async fn mutate(
    &self,
    def: &MutationDefinition,
    args: Value,
  ) -> Result<Value, FetchError> {
    self.mutate_optimistic(def, args, Vec::new()).await
  }

  /// Run a mutation, speculatively applying `updates` to the cache first.
  ///
  /// On success the speculative values stand and the mutation's tags are
  /// invalidated (subscribed entries refetch immediately, unsubscribed
  /// ones lazily). On failure every patch is rolled back, newest first,
  /// restoring the exact pre-mutation data.
  pub async fn mutate_optimistic(
    &self,
    def: &MutationDefinition,
    args: Value,
    updates: Vec<OptimisticUpdate>,
  ) -> Result<Value, FetchError> {
    let inner = &self.inner;
    let request = def.request(&args);

    let mutation_id = inner.optimistic.begin();
    let patches: Vec<_> = {
      let mut store = inner.store.lock().expect("cache lock poisoned");
      updates
        .into_iter()
        .filter_map(|update| inner.optimistic.apply(&mut store, mutation_id, update))
        .collect()
    };

    let result = inner.gate.execute(&inner.executor, &request).await;
    match &result {
      Ok(_) => {
        for patch in patches {
          inner.optimistic.commit(patch);
        }
        // Sequenced strictly after the response: nobody observes a world
        // where the mutation succeeded but no refetch was scheduled.
        inner.invalidate_tags(&def.invalidates_tags);
      }
      Err(e) => {
        debug!(endpoint = %def.endpoint_id, error = %e, "mutation failed, rolling back");
        let mut store = inner.store.lock().expect("cache lock poisoned");
        for patch in patches.into_iter().rev() {
          inner.optimistic.rollback(&mut store, patch);
        }
      }
    }
    result
  }

  /// Mark all entries carrying any of `tags` stale, refetching the
  /// currently subscribed ones.
  pub fn invalidate(&self, tags: &[Tag]) {
    self.inner.invalidate_tags(tags);
  }

  /// Seed the cache with a known value for a query invocation, outside
  /// the fetch path.
  pub fn write(&self, def: &QueryDefinition, args: &Value, data: Value) {
    let key = def.key(args);
    let ttl = def.ttl.unwrap_or_else(|| self.inner.config.default_ttl());
    let mut store = self.inner.store.lock().expect("cache lock poisoned");
    store.write(&key, data, def.tags.clone(), ttl);
  }

  /// Store a fresh token and clear any ended-session state.
  pub fn sign_in(&self, token: &str) {
    self.inner.tokens.set_token(token);
    self.inner.gate.reset();
  }

  /// Drop the token and fail all further requests until sign-in.
  pub fn sign_out(&self) {
    self.inner.tokens.clear_token();
    self.inner.gate.end_session();
  }

  /// True once auth refresh has failed terminally; cleared by `sign_in`.
  pub fn session_ended(&self) -> bool {
    self.inner.gate.is_unauthenticated()
  }

  pub fn stats(&self) -> RuntimeStats {
    let store = self.inner.store.lock().expect("cache lock poisoned");
    RuntimeStats {
      entries: store.entry_count(),
      subscriptions: store.subscription_count(),
      tags: store.tag_count(),
      polled: self.inner.polling.active_count(),
    }
  }
}

impl std::fmt::Debug for CacheRuntime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheRuntime").finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::MemoryTokenStore;
  use crate::transport::testing::ScriptedTransport;
  use serde_json::json;
  use std::time::Duration;

  fn runtime(transport: Arc<ScriptedTransport>) -> CacheRuntime {
    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token("t-1"));
    let refresh: RefreshFn = Arc::new(|| async { Ok("t-2".to_string()) }.boxed());
    CacheRuntime::new(RuntimeConfig::default(), transport, tokens, refresh)
  }

  fn projects_def() -> QueryDefinition {
    QueryDefinition::new("projects.list", |_| "/api/projects".to_string())
      .with_tags(["Project"])
      .with_ttl(Duration::from_secs(300))
  }

  fn employees_def() -> QueryDefinition {
    QueryDefinition::new("employees.list", |_| "/api/employees".to_string())
      .with_tags(["Employee"])
      .with_ttl(Duration::from_secs(300))
  }

  fn create_project_def() -> MutationDefinition {
    MutationDefinition::new("projects.create", |_| "/api/projects".to_string())
      .invalidates(["Project"])
  }

  /// Let spawned tasks and freshly woken timers run.
  async fn drain_tasks() {
    for _ in 0..16 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_subscriptions_share_one_fetch() {
    let transport = Arc::new(
      ScriptedTransport::new().with_latency(Duration::from_millis(10)),
    );
    transport.push_ok(json!([{"id": 1}]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut first = runtime.query(&def, json!({}));
    let second = runtime.query(&def, json!({}));
    let third = runtime.query(&def, json!({}));
    assert!(first.snapshot().is_loading());

    let snapshot = first.settled().await;
    assert_eq!(snapshot.data, Some(json!([{"id": 1}])));
    assert_eq!(transport.request_count(), 1);
    assert_eq!(second.snapshot().data, third.snapshot().data);
    assert_eq!(runtime.stats().subscriptions, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn mutation_invalidates_matching_tags_only() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["p1"]));
    transport.push_ok(json!(["e1"]));
    let runtime = runtime(transport.clone());

    let mut projects = runtime.query(&projects_def(), json!({}));
    projects.settled().await;
    let mut employees = runtime.query(&employees_def(), json!({}));
    employees.settled().await;
    assert_eq!(transport.request_count(), 2);

    transport.push_ok(json!({"id": 2}));
    transport.push_ok(json!(["p1", "p2"]));
    runtime
      .mutate(&create_project_def(), json!({"name": "p2"}))
      .await
      .unwrap();

    let snapshot = projects.settled().await;
    assert_eq!(snapshot.data, Some(json!(["p1", "p2"])));
    // Mutation plus one refetch of the Project-tagged query; the
    // Employee-tagged entry was not touched.
    assert_eq!(transport.request_count(), 4);
    assert_eq!(employees.snapshot().data, Some(json!(["e1"])));
    assert!(!employees.snapshot().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn invalidation_of_unsubscribed_entry_is_deferred() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["p1"]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;
    drop(handle);
    drain_tasks().await;
    assert_eq!(transport.request_count(), 1);

    transport.push_ok(json!({"id": 2}));
    runtime
      .mutate(&create_project_def(), json!({"name": "p2"}))
      .await
      .unwrap();
    drain_tasks().await;
    // Stale-marked but not refetched: nobody is watching.
    assert_eq!(transport.request_count(), 2);

    // The next subscription refetches instead of serving the stale value.
    transport.push_ok(json!(["p1", "p2"]));
    let mut handle = runtime.query(&def, json!({}));
    let snapshot = handle.settled().await;
    assert_eq!(snapshot.data, Some(json!(["p1", "p2"])));
    assert_eq!(transport.request_count(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn failed_mutation_rolls_back_optimistic_edit() {
    let transport = Arc::new(
      ScriptedTransport::new().with_latency(Duration::from_millis(10)),
    );
    transport.push_ok(json!([{"id": 1, "name": "A"}]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;

    transport.push_response(500, json!({}));
    let key = def.key(&json!({}));
    let mutation = tokio::spawn({
      let runtime = runtime.clone();
      async move {
        let rename =
          MutationDefinition::new("projects.rename", |_| "/api/projects/1".to_string())
            .invalidates(["Project"]);
        runtime
          .mutate_optimistic(
            &rename,
            json!({"name": "B"}),
            vec![OptimisticUpdate::new(key, |_| {
              json!([{"id": 1, "name": "B"}])
            })],
          )
          .await
      }
    });
    drain_tasks().await;
    // Speculative value is visible while the call is in flight.
    assert_eq!(handle.snapshot().data, Some(json!([{"id": 1, "name": "B"}])));

    let result = mutation.await.unwrap();
    assert_eq!(result, Err(FetchError::Server { status: 500 }));
    // Restored exactly, not merged.
    assert_eq!(handle.snapshot().data, Some(json!([{"id": 1, "name": "A"}])));
  }

  #[tokio::test(start_paused = true)]
  async fn successful_mutation_keeps_speculative_value_until_refetch() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["A"]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;

    transport.push_ok(json!({"ok": true}));
    transport.push_ok(json!(["A", "B"]));
    let key = def.key(&json!({}));
    runtime
      .mutate_optimistic(
        &create_project_def(),
        json!({"name": "B"}),
        vec![OptimisticUpdate::new(key, |data| {
          let mut list = data.cloned().unwrap_or_else(|| json!([]));
          list.as_array_mut().unwrap().push(json!("B"));
          list
        })],
      )
      .await
      .unwrap();

    let snapshot = handle.settled().await;
    assert_eq!(snapshot.data, Some(json!(["A", "B"])));
  }

  #[tokio::test(start_paused = true)]
  async fn idle_entry_is_evicted_after_exactly_ttl() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["p1"]));
    let runtime = runtime(transport.clone());
    let def = projects_def(); // ttl = 300s

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;
    drop(handle);
    drain_tasks().await;

    tokio::time::advance(Duration::from_millis(299_999)).await;
    drain_tasks().await;
    assert_eq!(runtime.stats().entries, 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    drain_tasks().await;
    assert_eq!(runtime.stats().entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn fetch_outliving_ttl_is_applied_before_eviction() {
    let transport = Arc::new(
      ScriptedTransport::new().with_latency(Duration::from_secs(50)),
    );
    transport.push_ok(json!(["slow"]));
    let runtime = runtime(transport.clone());
    let def = QueryDefinition::new("reports.slow", |_| "/api/reports".to_string())
      .with_ttl(Duration::from_secs(5));

    let handle = runtime.query(&def, json!({}));
    drain_tasks().await;
    drop(handle);
    drain_tasks().await;

    // The 5s eviction timer fires while the 50s fetch is still in flight
    // and must not discard the pending result.
    tokio::time::advance(Duration::from_secs(6)).await;
    drain_tasks().await;
    assert_eq!(runtime.stats().entries, 1);

    // The fetch lands, is applied, and the entry is served from cache.
    tokio::time::advance(Duration::from_secs(45)).await;
    drain_tasks().await;
    let handle = runtime.query(&def, json!({}));
    assert_eq!(handle.snapshot().data, Some(json!(["slow"])));
    assert_eq!(transport.request_count(), 1);

    // Once unobserved again, a full TTL from the landing evicts it.
    drop(handle);
    drain_tasks().await;
    tokio::time::advance(Duration::from_secs(6)).await;
    drain_tasks().await;
    assert_eq!(runtime.stats().entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn resubscription_cancels_eviction() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["p1"]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;
    drop(handle);
    drain_tasks().await;

    tokio::time::advance(Duration::from_secs(100)).await;
    drain_tasks().await;
    let handle = runtime.query(&def, json!({}));
    // Still fresh at 100s of a 300s TTL: served from cache, no refetch.
    assert_eq!(transport.request_count(), 1);
    assert_eq!(handle.snapshot().data, Some(json!(["p1"])));

    // The timer armed at unsubscribe fires at 300s and must be a no-op.
    tokio::time::advance(Duration::from_secs(300)).await;
    drain_tasks().await;
    assert_eq!(runtime.stats().entries, 1);
    assert_eq!(handle.snapshot().data, Some(json!(["p1"])));
  }

  #[tokio::test(start_paused = true)]
  async fn stale_entry_serves_data_while_revalidating() {
    let transport = Arc::new(
      ScriptedTransport::new().with_latency(Duration::from_millis(10)),
    );
    transport.push_ok(json!("v1"));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut keepalive = runtime.query(&def, json!({}));
    keepalive.settled().await;

    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(keepalive.snapshot().is_stale);

    transport.push_ok(json!("v2"));
    let mut handle = runtime.query(&def, json!({}));
    drain_tasks().await;
    // Old data served synchronously alongside the background refetch;
    // never a gap with no data.
    let during = handle.snapshot();
    assert!(during.is_loading());
    assert_eq!(during.data, Some(json!("v1")));

    let after = handle.settled().await;
    assert_eq!(after.data, Some(json!("v2")));
    assert!(after.is_success());
  }

  #[tokio::test(start_paused = true)]
  async fn failed_refetch_keeps_serving_last_good_value() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(["p1"]));
    let runtime = runtime(transport.clone());
    let def = projects_def();

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;

    transport.push_response(500, json!({}));
    runtime.invalidate(&[Tag::new("Project")]);
    drain_tasks().await;

    let snapshot = handle.snapshot();
    assert!(snapshot.is_error());
    assert_eq!(snapshot.data, Some(json!(["p1"])));
    assert!(snapshot.stale_error().is_some());

    // A later refetch recovers.
    transport.push_ok(json!(["p1", "p2"]));
    handle.refetch();
    let snapshot = handle.settled().await;
    assert_eq!(snapshot.data, Some(json!(["p1", "p2"])));
    assert!(snapshot.stale_error().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn polling_refetches_only_while_subscribed() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_ok(json!(1));
    transport.push_ok(json!(2));
    transport.push_ok(json!(3));
    let runtime = runtime(transport.clone());
    let def = QueryDefinition::new("dashboard.stats", |_| "/api/stats".to_string())
      .with_ttl(Duration::from_secs(3600))
      .with_poll_interval(Duration::from_secs(30));

    let mut handle = runtime.query(&def, json!({}));
    handle.settled().await;
    assert_eq!(transport.request_count(), 1);
    assert_eq!(runtime.stats().polled, 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    drain_tasks().await;
    assert_eq!(transport.request_count(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    drain_tasks().await;
    assert_eq!(transport.request_count(), 3);
    assert_eq!(handle.snapshot().data, Some(json!(3)));

    drop(handle);
    drain_tasks().await;
    assert_eq!(runtime.stats().polled, 0);
    tokio::time::advance(Duration::from_secs(120)).await;
    drain_tasks().await;
    assert_eq!(transport.request_count(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn poll_tick_during_fetch_joins_instead_of_duplicating() {
    let transport = Arc::new(
      ScriptedTransport::new().with_latency(Duration::from_secs(50)),
    );
    transport.push_ok(json!(1));
    let runtime = runtime(transport.clone());
    let def = QueryDefinition::new("dashboard.stats", |_| "/api/stats".to_string())
      .with_ttl(Duration::from_secs(3600))
      .with_poll_interval(Duration::from_secs(30));

    let _handle = runtime.query(&def, json!({}));
    drain_tasks().await;

    // The 30s poll tick fires while the initial 50s fetch is still in
    // flight and must not issue a second request.
    tokio::time::advance(Duration::from_secs(40)).await;
    drain_tasks().await;
    assert_eq!(transport.request_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn seeded_write_is_served_without_fetching() {
    let transport = Arc::new(ScriptedTransport::new());
    let runtime = runtime(transport.clone());
    let def = projects_def();

    runtime.write(&def, &json!({}), json!(["seeded"]));
    let handle = runtime.query(&def, json!({}));
    assert_eq!(handle.snapshot().data, Some(json!(["seeded"])));
    assert_eq!(transport.request_count(), 0);
    assert_eq!(runtime.stats().tags, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn session_lifecycle_gates_requests() {
    let transport = Arc::new(ScriptedTransport::new());
    let runtime = runtime(transport.clone());

    runtime.sign_out();
    assert!(runtime.session_ended());
    let result = runtime
      .mutate(&create_project_def(), json!({"name": "x"}))
      .await;
    assert_eq!(result, Err(FetchError::AuthExpired));
    assert_eq!(transport.request_count(), 0);

    transport.push_ok(json!({"id": 1}));
    runtime.sign_in("t-fresh");
    assert!(!runtime.session_ended());
    let result = runtime
      .mutate(&create_project_def(), json!({"name": "x"}))
      .await;
    assert_eq!(result, Ok(json!({"id": 1})));
  }
}
