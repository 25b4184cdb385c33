//! The cache core: entries, tag index, store, and optimistic updates.
//!
//! Everything here is synchronous data structure code; the async
//! orchestration (fetching, eviction timers, polling) lives in the
//! runtime, which owns a single lock around [`store::CacheStore`].

pub(crate) mod entry;
pub(crate) mod optimistic;
pub(crate) mod store;
pub(crate) mod tags;

pub use entry::{QuerySnapshot, QueryStatus};
pub use optimistic::OptimisticUpdate;
