//! Token storage and single-flight authentication refresh.
//!
//! [`AuthRefreshGate`] guarantees that arbitrarily many concurrent 401s
//! produce at most one token-refresh call. The first request to observe
//! `AuthRequired` becomes the refresher; every later one parks on a FIFO
//! wait queue and is woken in arrival order once the refresh resolves.
//! Each parked request replays exactly once with the new token; a request
//! that is rejected even then surfaces `AuthExpired` and trips a terminal
//! `Unauthenticated` state that only a new sign-in clears.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::executor::RequestExecutor;
use crate::transport::ApiRequest;

/// Where the bearer token lives. The runtime never persists tokens; the
/// application supplies the store.
pub trait TokenStore: Send + Sync {
  fn get_token(&self) -> Option<String>;
  fn set_token(&self, token: &str);
  fn clear_token(&self);
}

/// In-memory token store.
pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
  pub fn new() -> Self {
    Self {
      token: Mutex::new(None),
    }
  }

  pub fn with_token(token: &str) -> Self {
    Self {
      token: Mutex::new(Some(token.to_string())),
    }
  }
}

impl Default for MemoryTokenStore {
  fn default() -> Self {
    Self::new()
  }
}

impl TokenStore for MemoryTokenStore {
  fn get_token(&self) -> Option<String> {
    self.token.lock().unwrap().clone()
  }

  fn set_token(&self, token: &str) {
    *self.token.lock().unwrap() = Some(token.to_string());
  }

  fn clear_token(&self) {
    *self.token.lock().unwrap() = None;
  }
}

/// The refresh operation itself is a collaborator: an async closure that
/// returns the new token.
pub type RefreshFn =
  Arc<dyn Fn() -> BoxFuture<'static, Result<String, FetchError>> + Send + Sync>;

enum GateState {
  Idle,
  /// A refresh is in flight; parked requests wait here in arrival order.
  Refreshing {
    waiters: Vec<oneshot::Sender<Result<(), FetchError>>>,
  },
  /// Refresh failed or a retried request was rejected again. Terminal
  /// until `reset()`.
  Unauthenticated,
}

pub struct AuthRefreshGate {
  state: Mutex<GateState>,
  tokens: Arc<dyn TokenStore>,
  refresh: RefreshFn,
}

impl AuthRefreshGate {
  pub fn new(tokens: Arc<dyn TokenStore>, refresh: RefreshFn) -> Self {
    Self {
      state: Mutex::new(GateState::Idle),
      tokens,
      refresh,
    }
  }

  /// True once the session has ended and requests fail fast.
  pub fn is_unauthenticated(&self) -> bool {
    matches!(*self.state.lock().unwrap(), GateState::Unauthenticated)
  }

  /// Clear the terminal state after a new sign-in.
  pub fn reset(&self) {
    *self.state.lock().unwrap() = GateState::Idle;
  }

  /// Force the terminal state (sign-out). Parked waiters, if any, are
  /// failed with `AuthExpired`.
  pub fn end_session(&self) {
    let waiters = {
      let mut state = self.state.lock().unwrap();
      let waiters = match &mut *state {
        GateState::Refreshing { waiters } => std::mem::take(waiters),
        _ => Vec::new(),
      };
      *state = GateState::Unauthenticated;
      waiters
    };
    for waiter in waiters {
      let _ = waiter.send(Err(FetchError::AuthExpired));
    }
  }

  /// Execute a request, refreshing the token once on 401.
  ///
  /// This is the only retry loop in the crate, and it is bounded: one
  /// refresh, one replay. A second 401 ends the session.
  pub async fn execute(
    &self,
    executor: &RequestExecutor,
    request: &ApiRequest,
  ) -> Result<Value, FetchError> {
    if self.is_unauthenticated() {
      return Err(FetchError::AuthExpired);
    }

    match executor.execute(request).await {
      Err(FetchError::AuthRequired) => {
        self.wait_for_refresh().await?;
        match executor.execute(request).await {
          Err(FetchError::AuthRequired) => {
            warn!(url = %request.url, "request rejected after token refresh, ending session");
            self.end_session();
            Err(FetchError::AuthExpired)
          }
          other => other,
        }
      }
      other => other,
    }
  }

  /// Join the in-flight refresh, or become the refresher if idle.
  async fn wait_for_refresh(&self) -> Result<(), FetchError> {
    let parked = {
      let mut state = self.state.lock().unwrap();
      match &mut *state {
        GateState::Unauthenticated => return Err(FetchError::AuthExpired),
        GateState::Refreshing { waiters } => {
          let (tx, rx) = oneshot::channel();
          waiters.push(tx);
          Some(rx)
        }
        GateState::Idle => {
          *state = GateState::Refreshing {
            waiters: Vec::new(),
          };
          None
        }
      }
    };

    match parked {
      Some(rx) => match rx.await {
        Ok(result) => result,
        // Gate dropped mid-refresh; treat as an ended session.
        Err(_) => Err(FetchError::AuthExpired),
      },
      None => self.run_refresh().await,
    }
  }

  async fn run_refresh(&self) -> Result<(), FetchError> {
    debug!("refreshing auth token");
    let outcome = (self.refresh)().await;

    let (result, waiters) = {
      let mut state = self.state.lock().unwrap();
      let waiters = match &mut *state {
        GateState::Refreshing { waiters } => std::mem::take(waiters),
        // The session ended while the refresh was in flight. The terminal
        // state is cleared only by an explicit sign-in, so the outcome is
        // discarded even when the refresh succeeded.
        _ => return Err(FetchError::AuthExpired),
      };
      match outcome {
        Ok(token) => {
          self.tokens.set_token(&token);
          *state = GateState::Idle;
          (Ok(()), waiters)
        }
        Err(e) => {
          warn!(error = %e, "token refresh failed, ending session");
          self.tokens.clear_token();
          *state = GateState::Unauthenticated;
          (Err(FetchError::AuthExpired), waiters)
        }
      }
    };

    // Wake parked requests in arrival order; each replays exactly once.
    for waiter in waiters {
      let _ = waiter.send(result.clone());
    }

    result
  }
}
