//! Optimistic mutation support.
//!
//! A mutation may speculatively edit cached data before its network call
//! resolves. Every edit produces an [`OptimisticPatch`] that must reach
//! exactly one terminal phase: `commit` on mutation success (discard) or
//! `rollback` on failure (restore the exact prior value). The patch is an
//! explicit object rather than a closure so call sites cannot forget the
//! second phase.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::debug;

use super::store::CacheStore;
use crate::key::CacheKey;

/// A speculative edit requested by a mutation call site.
pub struct OptimisticUpdate {
  pub key: CacheKey,
  transform: Box<dyn FnOnce(Option<&Value>) -> Value + Send>,
}

impl OptimisticUpdate {
  pub fn new(
    key: CacheKey,
    transform: impl FnOnce(Option<&Value>) -> Value + Send + 'static,
  ) -> Self {
    Self {
      key,
      transform: Box::new(transform),
    }
  }
}

/// Reversible record of one applied speculative edit.
///
/// `before` is a full snapshot of the prior data, so rollback restores it
/// exactly rather than merging.
#[must_use = "an optimistic patch must be committed or rolled back"]
pub(crate) struct OptimisticPatch {
  mutation_id: u64,
  key: CacheKey,
  before: Option<Value>,
}

pub(crate) struct OptimisticUpdateManager {
  next_mutation_id: AtomicU64,
}

impl OptimisticUpdateManager {
  pub fn new() -> Self {
    Self {
      next_mutation_id: AtomicU64::new(1),
    }
  }

  /// Reserve an id for one mutation; all of its patches share it.
  pub fn begin(&self) -> u64 {
    self.next_mutation_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Apply a speculative edit and record its inverse. Returns `None` when
  /// the target entry does not exist; there is nothing to patch and
  /// nothing to roll back.
  pub fn apply(
    &self,
    store: &mut CacheStore,
    mutation_id: u64,
    update: OptimisticUpdate,
  ) -> Option<OptimisticPatch> {
    let entry = store.get_mut(&update.key)?;
    let before = entry.data.clone();
    let after = (update.transform)(before.as_ref());
    entry.data = Some(after);
    entry.touch();

    debug!(mutation_id, key = %update.key, "applied optimistic update");
    Some(OptimisticPatch {
      mutation_id,
      key: update.key,
      before,
    })
  }

  /// Mutation succeeded: the speculative value stands until invalidation
  /// refetches it. The patch is discarded.
  pub fn commit(&self, patch: OptimisticPatch) {
    debug!(mutation_id = patch.mutation_id, key = %patch.key, "committed optimistic update");
  }

  /// Mutation failed: restore the exact prior value. A no-op when the
  /// entry was evicted in the meantime.
  pub fn rollback(&self, store: &mut CacheStore, patch: OptimisticPatch) {
    debug!(mutation_id = patch.mutation_id, key = %patch.key, "rolling back optimistic update");
    if let Some(entry) = store.get_mut(&patch.key) {
      entry.data = patch.before;
      entry.touch();
    }
  }
}
