//! Reverse index from tag to cache keys.
//!
//! Kept exactly in sync with the union of `tags` across live entries:
//! every store insert/remove updates the index in the same locked section,
//! so a tag bucket can never point at a key the store no longer holds.

use std::collections::{HashMap, HashSet};

use crate::key::{CacheKey, Tag};

#[derive(Default)]
pub(crate) struct TagIndex {
  buckets: HashMap<Tag, HashSet<CacheKey>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, key: &CacheKey, tags: &[Tag]) {
    for tag in tags {
      self
        .buckets
        .entry(tag.clone())
        .or_default()
        .insert(key.clone());
    }
  }

  /// Remove a key from every bucket it appears in, dropping buckets that
  /// become empty.
  pub fn unregister(&mut self, key: &CacheKey, tags: &[Tag]) {
    for tag in tags {
      if let Some(bucket) = self.buckets.get_mut(tag) {
        bucket.remove(key);
        if bucket.is_empty() {
          self.buckets.remove(tag);
        }
      }
    }
  }

  /// Every key reachable from any of the given tags, deduplicated.
  pub fn keys_for(&self, tags: &[Tag]) -> HashSet<CacheKey> {
    let mut keys = HashSet::new();
    for tag in tags {
      if let Some(bucket) = self.buckets.get(tag) {
        keys.extend(bucket.iter().cloned());
      }
    }
    keys
  }

  pub fn tag_count(&self) -> usize {
    self.buckets.len()
  }
}
