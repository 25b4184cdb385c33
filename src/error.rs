//! Error taxonomy for requests flowing through the cache runtime.
//!
//! Every network outcome is classified into exactly one [`FetchError`]
//! variant by the request executor. `AuthRequired` is internal to the
//! auth refresh gate and is never surfaced to consumers directly; a
//! request that still fails after one retry with a fresh token becomes
//! `AuthExpired`.

use serde::{Deserialize, Serialize};

/// Structured error body from the wire: `{"error": {"code", "message"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
  pub code: String,
  pub message: String,
}

/// Classified outcome of a failed request.
///
/// Cloneable so a single in-flight failure can be shared with every
/// caller deduplicated onto the same fetch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
  /// No response reached the server (DNS, connect, timeout).
  #[error("network error: {0}")]
  Network(String),

  /// HTTP 4xx other than 401, with the decoded error body when present.
  #[error("request rejected with status {status}")]
  Client { status: u16, error: Option<ErrorBody> },

  /// HTTP 5xx. Not retried automatically.
  #[error("server error {status}")]
  Server { status: u16 },

  /// HTTP 401. Internal signal for the refresh gate, never surfaced.
  #[error("authentication required")]
  AuthRequired,

  /// Token refresh failed, or a retried request was rejected again.
  /// Escalated to a process-wide session-ended state.
  #[error("session expired")]
  AuthExpired,

  /// A background refetch failed but a previously cached value is still
  /// being served. Non-fatal; carried as snapshot metadata.
  #[error("serving cached data, background refresh failed: {0}")]
  StaleRead(Box<FetchError>),
}

impl FetchError {
  /// True when the cached value alongside this error is still usable.
  pub fn is_stale_read(&self) -> bool {
    matches!(self, FetchError::StaleRead(_))
  }

  /// The wire error body, if this failure carried one.
  pub fn body(&self) -> Option<&ErrorBody> {
    match self {
      FetchError::Client { error, .. } => error.as_ref(),
      FetchError::StaleRead(inner) => inner.body(),
      _ => None,
    }
  }
}
