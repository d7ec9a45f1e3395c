//! Network boundary: request/response types and the fetcher abstraction.

mod client;
#[cfg(test)]
pub mod stub;

pub use client::HttpFetcher;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// An outgoing request as seen by the cache manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET for `url`.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A mutating request carrying a JSON body.
  pub fn with_json(method: Method, url: Url, payload: Option<&serde_json::Value>) -> Self {
    let (headers, body) = match payload {
      Some(value) => (
        vec![("content-type".to_string(), "application/json".to_string())],
        Some(value.to_string().into_bytes()),
      ),
      None => (Vec::new(), None),
    };

    Self {
      method,
      url,
      headers,
      body,
    }
  }

  /// Key used for cache entries. Query strings are significant, fragments are not.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

/// A response, whether it came from the network, a cache bucket, or was synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A JSON response with the matching content type.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Why a network fetch produced no response at all.
///
/// An HTTP error status is still a response; these variants mean the request
/// never completed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl FetchError {
  /// Connectivity failures are the ones worth falling back or queueing for.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Unreachable(_) | Self::Timeout(_))
  }
}

/// Anything that can put a request on the wire.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// Fetch with an optional upper bound; running out of time is a network failure.
pub async fn fetch_with_timeout<F: Fetcher>(
  network: &F,
  request: &Request,
  timeout: Option<Duration>,
) -> Result<Response, FetchError> {
  match timeout {
    Some(limit) => tokio::time::timeout(limit, network.fetch(request))
      .await
      .map_err(|_| FetchError::Timeout(limit))?,
    None => network.fetch(request).await,
  }
}
