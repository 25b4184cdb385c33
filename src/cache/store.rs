//! The cache store: keyed entries plus the tag index.
//!
//! This is the single mutable shared resource in the runtime. All access
//! goes through one lock held only across synchronous sections; the tag
//! index is updated in the same section as every entry insert or removal
//! so index and store can never diverge.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::entry::{CacheEntry, QueryStatus};
use super::tags::TagIndex;
use crate::key::{CacheKey, Tag};
use crate::transport::ApiRequest;

pub(crate) struct CacheStore {
  entries: HashMap<CacheKey, CacheEntry>,
  tags: TagIndex,
}

impl CacheStore {
  pub fn new() -> Self {
    Self {
      entries: HashMap::new(),
      tags: TagIndex::new(),
    }
  }

  pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
    self.entries.get_mut(key)
  }

  /// Get or create the entry for a query invocation. Tags are fixed at
  /// creation; a later call with the same key never rewrites them.
  pub fn ensure_entry(
    &mut self,
    key: &CacheKey,
    ttl: Duration,
    poll_interval: Option<Duration>,
    tags: Vec<Tag>,
    request: ApiRequest,
  ) -> &mut CacheEntry {
    if !self.entries.contains_key(key) {
      self.tags.register(key, &tags);
      self
        .entries
        .insert(key.clone(), CacheEntry::new(ttl, poll_interval, tags));
    }
    let entry = self.entries.get_mut(key).unwrap();
    if entry.request.is_none() {
      entry.request = Some(request);
    }
    // Seeded entries learn their poll interval from the first real
    // query definition that subscribes.
    if entry.poll_interval.is_none() {
      entry.poll_interval = poll_interval;
    }
    entry
  }

  /// Upsert an entry with known data, registering its tags. Used for
  /// seeding the cache outside the fetch path.
  pub fn write(&mut self, key: &CacheKey, data: Value, tags: Vec<Tag>, ttl: Duration) {
    if !self.entries.contains_key(key) {
      self.tags.register(key, &tags);
      self
        .entries
        .insert(key.clone(), CacheEntry::new(ttl, None, tags));
    }
    let entry = self.entries.get_mut(key).unwrap();

    entry.status = QueryStatus::Success;
    entry.data = Some(data);
    entry.error = None;
    entry.fetched_at = Some(Instant::now());
    entry.fetched_at_utc = Some(chrono::Utc::now());
    entry.touch();
  }

  /// Remove an entry and scrub it from every tag bucket.
  pub fn remove(&mut self, key: &CacheKey) -> bool {
    match self.entries.remove(key) {
      Some(entry) => {
        self.tags.unregister(key, &entry.tags);
        true
      }
      None => false,
    }
  }

  /// Mark every entry reachable from the given tags as stale. Returns the
  /// touched keys along with whether each currently has subscribers, so
  /// the caller can refetch the observed ones immediately and leave the
  /// rest for their next subscription.
  pub fn mark_stale_by_tags(&mut self, tags: &[Tag]) -> Vec<(CacheKey, bool)> {
    let keys = self.tags.keys_for(tags);
    let mut touched = Vec::with_capacity(keys.len());
    for key in keys {
      if let Some(entry) = self.entries.get_mut(&key) {
        entry.fetched_at = None;
        entry.touch();
        touched.push((key, entry.subscriber_count > 0));
      }
    }
    touched
  }

  pub fn keys_for_tags(&self, tags: &[Tag]) -> HashSet<CacheKey> {
    self.tags.keys_for(tags)
  }

  pub fn entry_count(&self) -> usize {
    self.entries.len()
  }

  pub fn subscription_count(&self) -> usize {
    self.entries.values().map(|e| e.subscriber_count).sum()
  }

  pub fn tag_count(&self) -> usize {
    self.tags.tag_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key::cache_key;
  use crate::transport::Method;
  use serde_json::json;

  fn request() -> ApiRequest {
    ApiRequest::new(Method::Get, "/api/test")
  }

  #[tokio::test(start_paused = true)]
  async fn write_then_read() {
    let mut store = CacheStore::new();
    let key = cache_key("projects.list", &json!({}));
    store.write(
      &key,
      json!([1, 2]),
      vec![Tag::new("Project")],
      Duration::from_secs(60),
    );

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, QueryStatus::Success);
    assert_eq!(entry.data, Some(json!([1, 2])));
    assert_eq!(store.keys_for_tags(&[Tag::new("Project")]).len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn ensure_entry_fixes_tags_at_creation() {
    let mut store = CacheStore::new();
    let key = cache_key("projects.list", &json!({}));
    store.ensure_entry(
      &key,
      Duration::from_secs(60),
      None,
      vec![Tag::new("Project")],
      request(),
    );
    // Second ensure with different tags must not change registration.
    store.ensure_entry(
      &key,
      Duration::from_secs(60),
      None,
      vec![Tag::new("Other")],
      request(),
    );

    assert_eq!(store.keys_for_tags(&[Tag::new("Project")]).len(), 1);
    assert!(store.keys_for_tags(&[Tag::new("Other")]).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn remove_scrubs_tag_index() {
    let mut store = CacheStore::new();
    let key = cache_key("projects.list", &json!({}));
    store.write(
      &key,
      json!([]),
      vec![Tag::new("Project")],
      Duration::from_secs(60),
    );

    assert!(store.remove(&key));
    assert!(store.keys_for_tags(&[Tag::new("Project")]).is_empty());
    assert_eq!(store.tag_count(), 0);
    assert!(!store.remove(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn mark_stale_reports_subscription_state() {
    let mut store = CacheStore::new();
    let observed = cache_key("projects.list", &json!({}));
    let idle = cache_key("projects.archived", &json!({}));
    let unrelated = cache_key("employees.list", &json!({}));

    for (key, tag) in [
      (&observed, "Project"),
      (&idle, "Project"),
      (&unrelated, "Employee"),
    ] {
      store.write(key, json!([]), vec![Tag::new(tag)], Duration::from_secs(60));
    }
    store.get_mut(&observed).unwrap().subscriber_count = 1;

    let touched = store.mark_stale_by_tags(&[Tag::new("Project")]);
    assert_eq!(touched.len(), 2);
    assert!(touched.contains(&(observed.clone(), true)));
    assert!(touched.contains(&(idle.clone(), false)));

    // Touched entries are stale now; the unrelated one is untouched.
    assert!(store.get(&observed).unwrap().fetched_at.is_none());
    assert!(store.get(&unrelated).unwrap().fetched_at.is_some());
  }
}
