//! Query and mutation definitions.
//!
//! Feature modules describe their endpoints with these structs and nothing
//! else: a stable endpoint id, a URL builder over the arguments, the cache
//! tags a query registers under, and the tags a mutation invalidates. The
//! runtime derives cache keys, freshness, and invalidation reach from them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::key::{cache_key, CacheKey, Tag};
use crate::transport::{ApiRequest, Method};

type UrlFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// A read endpoint: cached, tagged, optionally polled.
#[derive(Clone)]
pub struct QueryDefinition {
  pub endpoint_id: String,
  pub method: Method,
  url: UrlFn,
  pub tags: Vec<Tag>,
  /// Per-entry TTL; falls back to the runtime default when unset.
  pub ttl: Option<Duration>,
  /// When set, subscribed entries refetch on this interval.
  pub poll_interval: Option<Duration>,
}

impl QueryDefinition {
  pub fn new(
    endpoint_id: impl Into<String>,
    url: impl Fn(&Value) -> String + Send + Sync + 'static,
  ) -> Self {
    Self {
      endpoint_id: endpoint_id.into(),
      method: Method::Get,
      url: Arc::new(url),
      tags: Vec::new(),
      ttl: None,
      poll_interval: None,
    }
  }

  pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<Tag>>) -> Self {
    self.tags = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = Some(interval);
    self
  }

  /// The cache key for one invocation of this query.
  pub fn key(&self, args: &Value) -> CacheKey {
    cache_key(&self.endpoint_id, args)
  }

  /// Build the request template for one invocation. GET requests carry
  /// their arguments in the URL only.
  pub fn request(&self, args: &Value) -> ApiRequest {
    let mut request = ApiRequest::new(self.method, (self.url)(args));
    if self.method != Method::Get && !args.is_null() {
      request = request.with_body(args.clone());
    }
    request
  }
}

impl std::fmt::Debug for QueryDefinition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryDefinition")
      .field("endpoint_id", &self.endpoint_id)
      .field("method", &self.method)
      .field("tags", &self.tags)
      .field("ttl", &self.ttl)
      .field("poll_interval", &self.poll_interval)
      .finish_non_exhaustive()
  }
}

/// A write endpoint: uncached, invalidates tagged queries on success.
#[derive(Clone)]
pub struct MutationDefinition {
  pub endpoint_id: String,
  pub method: Method,
  url: UrlFn,
  pub invalidates_tags: Vec<Tag>,
}

impl MutationDefinition {
  pub fn new(
    endpoint_id: impl Into<String>,
    url: impl Fn(&Value) -> String + Send + Sync + 'static,
  ) -> Self {
    Self {
      endpoint_id: endpoint_id.into(),
      method: Method::Post,
      url: Arc::new(url),
      invalidates_tags: Vec::new(),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn invalidates(mut self, tags: impl IntoIterator<Item = impl Into<Tag>>) -> Self {
    self.invalidates_tags = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn request(&self, args: &Value) -> ApiRequest {
    let mut request = ApiRequest::new(self.method, (self.url)(args));
    if self.method != Method::Get && !args.is_null() {
      request = request.with_body(args.clone());
    }
    request
  }
}

impl std::fmt::Debug for MutationDefinition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MutationDefinition")
      .field("endpoint_id", &self.endpoint_id)
      .field("method", &self.method)
      .field("invalidates_tags", &self.invalidates_tags)
      .finish_non_exhaustive()
  }
}
