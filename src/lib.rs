//! Client-side query cache and synchronization runtime.
//!
//! `requery` keeps one request-scoped cache keyed by query identity, with
//! tag-based invalidation, TTL-driven eviction, subscriber reference
//! counting, optimistic mutations with rollback, polling, and
//! single-flight token refresh. Feature modules only supply endpoint
//! definitions (URL, tags, TTL); everything about freshness and
//! coherence lives here.
//!
//! # Example
//!
//! ```ignore
//! let runtime = CacheRuntime::new(
//!     RuntimeConfig::default(),
//!     Arc::new(ReqwestTransport::new()),
//!     Arc::new(MemoryTokenStore::new()),
//!     refresh_fn,
//! );
//!
//! let projects = QueryDefinition::new("projects.list", |_| "/api/projects".into())
//!     .with_tags(["Project"]);
//!
//! let mut handle = runtime.query(&projects, json!({}));
//! let snapshot = handle.settled().await;
//! // snapshot.data, snapshot.status, snapshot.error
//!
//! let create = MutationDefinition::new("projects.create", |_| "/api/projects".into())
//!     .invalidates(["Project"]);
//! runtime.mutate(&create, json!({"name": "Alpha"})).await?;
//! // every subscribed Project-tagged query refetches
//! ```

mod auth;
mod cache;
mod config;
mod definition;
mod error;
mod executor;
mod key;
mod polling;
mod runtime;
mod subscription;
mod transport;

pub use auth::{AuthRefreshGate, MemoryTokenStore, RefreshFn, TokenStore};
pub use cache::{OptimisticUpdate, QuerySnapshot, QueryStatus};
pub use config::{ConfigError, RuntimeConfig};
pub use definition::{MutationDefinition, QueryDefinition};
pub use error::{ErrorBody, FetchError};
pub use key::{cache_key, CacheKey, Tag};
pub use runtime::{CacheRuntime, RuntimeStats};
pub use subscription::QueryHandle;
pub use transport::{ApiRequest, Method, RawResponse, ReqwestTransport, Transport, TransportError};
