//! Request execution and outcome classification.
//!
//! One executor call is one network call. The executor injects the bearer
//! token, then maps the raw response onto the [`FetchError`] taxonomy:
//! transport failure → `Network`, 401 → `AuthRequired` (retry policy lives
//! in the auth refresh gate, never here), other 4xx → `Client`, 5xx →
//! `Server`. A 2xx response yields the `data` field of the body.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::auth::TokenStore;
use crate::error::{ErrorBody, FetchError};
use crate::transport::{ApiRequest, Transport};

pub struct RequestExecutor {
  transport: Arc<dyn Transport>,
  tokens: Arc<dyn TokenStore>,
}

impl RequestExecutor {
  pub fn new(transport: Arc<dyn Transport>, tokens: Arc<dyn TokenStore>) -> Self {
    Self { transport, tokens }
  }

  /// Issue one request with the current token attached and classify the
  /// outcome. Does not retry under any circumstances.
  pub async fn execute(&self, request: &ApiRequest) -> Result<Value, FetchError> {
    let mut request = request.clone();
    if let Some(token) = self.tokens.get_token() {
      request
        .headers
        .push(("Authorization".to_string(), format!("Bearer {}", token)));
    }

    debug!(method = %request.method, url = %request.url, "executing request");

    let response = self
      .transport
      .send(&request)
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    match response.status {
      200..=299 => Ok(extract_data(response.body)),
      401 => Err(FetchError::AuthRequired),
      status @ 400..=499 => Err(FetchError::Client {
        status,
        error: extract_error(response.body),
      }),
      status => Err(FetchError::Server { status }),
    }
  }
}

/// Successful responses carry `{"data": ...}`; a bare body is passed
/// through for endpoints that skip the envelope.
fn extract_data(body: Option<Value>) -> Value {
  match body {
    Some(Value::Object(mut map)) if map.contains_key("data") => {
      map.remove("data").unwrap_or(Value::Null)
    }
    Some(other) => other,
    None => Value::Null,
  }
}

/// Error responses carry `{"error": {"code", "message"}}`.
fn extract_error(body: Option<Value>) -> Option<ErrorBody> {
  let error = body?.get("error")?.clone();
  serde_json::from_value(error).ok()
}
