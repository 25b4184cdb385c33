//! Cache entries and consumer-visible snapshots.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::key::Tag;
use crate::transport::ApiRequest;

/// A fetch that may be joined by any number of callers (single-flight).
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Entry exists but no fetch has been issued yet.
  Idle,
  /// A fetch is in flight. Previously cached data, if any, stays readable.
  Loading,
  /// The last fetch succeeded.
  Success,
  /// The last fetch failed. `data` still holds the last good value.
  Error,
}

/// One cached query result and its bookkeeping.
///
/// Owned exclusively by the store; the tag index and subscription counts
/// are derived views that are updated in the same locked section as every
/// entry mutation.
pub(crate) struct CacheEntry {
  pub status: QueryStatus,
  pub data: Option<Value>,
  pub error: Option<FetchError>,
  /// Monotonic clock for TTL math; `None` means never fetched or
  /// explicitly invalidated.
  pub fetched_at: Option<Instant>,
  /// Wall-clock companion for consumer display.
  pub fetched_at_utc: Option<DateTime<Utc>>,
  pub ttl: Duration,
  pub poll_interval: Option<Duration>,
  /// Fixed at creation; never mutated after.
  pub tags: Vec<Tag>,
  pub subscriber_count: usize,
  /// Set while a fetch is outstanding; cleared on completion.
  pub in_flight: Option<SharedFetch>,
  /// Request template for refetches. Entries seeded by a manual write
  /// have none and cannot be refetched.
  pub request: Option<ApiRequest>,
  /// Bumped every time `subscriber_count` drops to zero, so an eviction
  /// timer armed for an earlier idle period can never fire for a later
  /// one.
  pub idle_epoch: u64,
  version: u64,
  watch_tx: watch::Sender<u64>,
}

impl CacheEntry {
  pub fn new(ttl: Duration, poll_interval: Option<Duration>, tags: Vec<Tag>) -> Self {
    let (watch_tx, _) = watch::channel(0);
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      fetched_at: None,
      fetched_at_utc: None,
      ttl,
      poll_interval,
      tags,
      subscriber_count: 0,
      in_flight: None,
      request: None,
      idle_epoch: 0,
      version: 0,
      watch_tx,
    }
  }

  /// True when the entry has never completed a fetch or its data has
  /// outlived the TTL. Invalidation clears `fetched_at`, which makes the
  /// entry stale by definition.
  pub fn is_stale(&self, now: Instant) -> bool {
    match self.fetched_at {
      Some(at) => now.duration_since(at) >= self.ttl,
      None => true,
    }
  }

  /// Notify watchers that the entry changed.
  pub fn touch(&mut self) {
    self.version += 1;
    let _ = self.watch_tx.send(self.version);
  }

  pub fn subscribe_watch(&self) -> watch::Receiver<u64> {
    self.watch_tx.subscribe()
  }

  pub fn snapshot(&self, now: Instant) -> QuerySnapshot {
    // A failed background refetch over a still-present value is the
    // non-fatal stale-read condition, not a hard error.
    let error = self.error.clone().map(|e| {
      if self.data.is_some() && self.status == QueryStatus::Error {
        FetchError::StaleRead(Box::new(e))
      } else {
        e
      }
    });

    QuerySnapshot {
      status: self.status,
      data: self.data.clone(),
      error,
      fetched_at: self.fetched_at_utc,
      is_stale: self.is_stale(now),
    }
  }
}

/// Point-in-time view of a cache entry, handed to consumers.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
  pub status: QueryStatus,
  pub data: Option<Value>,
  pub error: Option<FetchError>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub is_stale: bool,
}

impl QuerySnapshot {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// The stale-read warning, if data is being served past a failed
  /// background refetch.
  pub fn stale_error(&self) -> Option<&FetchError> {
    self.error.as_ref().filter(|e| e.is_stale_read())
  }

  /// Deserialize the cached value. `None` when no data is cached or the
  /// cached shape does not match `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
    let data = self.data.clone()?;
    serde_json::from_value(data).ok()
  }
}
