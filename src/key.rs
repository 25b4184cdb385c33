//! Deterministic cache key derivation.
//!
//! A cache key identifies one query result: the endpoint identity plus the
//! canonical serialization of its arguments, hashed to a stable fixed-length
//! string. `serde_json::Value` keeps object keys in a sorted map, so two
//! argument objects that differ only in key ordering hash identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Identifier for one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Label attached to cache entries, used to batch-invalidate related
/// queries after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(pub String);

impl Tag {
  pub fn new(s: impl Into<String>) -> Self {
    Tag(s.into())
  }
}

impl std::fmt::Display for Tag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Tag {
  fn from(s: &str) -> Self {
    Tag(s.to_string())
  }
}

/// Derive the cache key for a query invocation.
///
/// The endpoint id namespaces the hash so two endpoints with identical
/// arguments never collide.
pub fn cache_key(endpoint_id: &str, args: &Value) -> CacheKey {
  let input = format!("{}:{}", endpoint_id, args);

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  CacheKey(hex::encode(hasher.finalize()))
}
