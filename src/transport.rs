//! HTTP transport seam.
//!
//! The runtime never talks to the network directly; it goes through the
//! [`Transport`] trait so the production `reqwest` implementation can be
//! swapped for scripted transports in tests. A transport reports `Err` only
//! when no response reached the server at all; any HTTP response, including
//! 4xx/5xx, comes back as an `Ok(RawResponse)` for the executor to classify.

use async_trait::async_trait;
use serde_json::Value;

/// HTTP method for an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One request as handed to the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub url: String,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
}

impl ApiRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      body: None,
      headers: Vec::new(),
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// An HTTP response before classification: status plus the decoded JSON
/// body, if the body was decodable.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub body: Option<Value>,
}

/// Transport failure: no response reached the server.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// The network boundary. One call, one response.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl Default for ReqwestTransport {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError(format!("request to {} failed: {}", request.url, e)))?;

    let status = response.status().as_u16();
    // Body decode failures are not transport failures; the executor
    // classifies on status alone when no body is available.
    let body = response.json::<Value>().await.ok();

    Ok(RawResponse { status, body })
  }
}
