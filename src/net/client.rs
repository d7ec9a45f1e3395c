use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;

use super::{FetchError, Fetcher, Request, Response};

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(connect_timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .user_agent(concat!("vestry/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    async move {
      let response = builder.send().await.map_err(classify)?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await.map_err(classify)?.to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}

/// Map a reqwest failure onto the cases the strategies care about.
fn classify(err: reqwest::Error) -> FetchError {
  if err.is_builder() {
    FetchError::Invalid(err.to_string())
  } else {
    FetchError::Unreachable(err.to_string())
  }
}
