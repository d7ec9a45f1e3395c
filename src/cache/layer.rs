//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedEntry};
use crate::net::{fetch_with_timeout, FetchError, Fetcher, Request, Response};

/// Body served by cache-first when neither cache nor network can answer.
pub const OFFLINE_TEXT: &str = "Offline content not available";

/// Error served by network-first when neither network nor cache can answer.
pub const OFFLINE_JSON_ERROR: &str = "Offline - data not available";

/// The two bucket names of the current deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
  /// Immutable build assets, filled at install
  pub static_bucket: String,
  /// Resources fetched at runtime
  pub dynamic_bucket: String,
}

impl Generations {
  pub fn new(static_bucket: impl Into<String>, dynamic_bucket: impl Into<String>) -> Self {
    Self {
      static_bucket: static_bucket.into(),
      dynamic_bucket: dynamic_bucket.into(),
    }
  }

  /// Whether `bucket` belongs to this deployment.
  pub fn is_current(&self, bucket: &str) -> bool {
    bucket == self.static_bucket || bucket == self.dynamic_bucket
  }

  pub fn buckets(&self) -> [&str; 2] {
    [&self.static_bucket, &self.dynamic_bucket]
  }
}

/// Cache layer that manages the caching strategies and network fetching.
///
/// This layer sits between the fetch interception boundary and the network,
/// providing transparent caching with offline support.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  network: Arc<F>,
  generations: Generations,
  /// Upper bound on a single network fetch
  timeout: Option<Duration>,
  /// Revalidation fetches that outlive the response they refresh
  background: Arc<Mutex<JoinSet<()>>>,
}

impl<S, F> CacheLayer<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  /// Create a new cache layer over the given storage and network.
  pub fn new(storage: Arc<S>, network: Arc<F>, generations: Generations) -> Self {
    Self {
      storage,
      network,
      generations,
      timeout: None,
      background: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Bound every network fetch; expiry counts as a network failure.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &F {
    &self.network
  }

  pub fn generations(&self) -> &Generations {
    &self.generations
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  /// Go to the network, honouring the configured timeout.
  pub async fn fetch_network(&self, request: &Request) -> Result<Response, FetchError> {
    fetch_with_timeout(self.network.as_ref(), request, self.timeout).await
  }

  /// Fetch a static asset with cache-first strategy.
  ///
  /// 1. Any current bucket has it - return it, no network
  /// 2. Otherwise fetch, keep a copy in the static bucket
  /// 3. Both failed - synthetic 503, never an error
  pub async fn cache_first(&self, request: &Request) -> CacheResult<Response> {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(&self.generations.buckets(), &key) {
      debug!(url = %key, bucket = %cached.bucket, "Cache hit");
      return CacheResult::from_cache(cached.response, cached.cached_at, false);
    }

    match self.fetch_network(request).await {
      Ok(response) => {
        store_copy(
          self.storage.as_ref(),
          &self.generations.static_bucket,
          &key,
          &response,
        );
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %key, "Network request failed: {}", e);
        CacheResult::synthetic(Response::new(503, OFFLINE_TEXT))
      }
    }
  }

  /// Fetch API data with network-first strategy.
  ///
  /// Fresh network data is copied into the dynamic bucket. On network failure
  /// any cached copy is served (offline mode), else a synthetic JSON 503.
  pub async fn network_first(&self, request: &Request) -> CacheResult<Response> {
    let key = request.cache_key();

    match self.fetch_network(request).await {
      Ok(response) => {
        store_copy(
          self.storage.as_ref(),
          &self.generations.dynamic_bucket,
          &key,
          &response,
        );
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %key, "Network failed, falling back to cache: {}", e);
        match self.lookup(&self.generations.buckets(), &key) {
          Some(cached) => CacheResult::offline(cached.response, cached.cached_at),
          None => CacheResult::synthetic(Response::json(
            503,
            &serde_json::json!({ "error": OFFLINE_JSON_ERROR }),
          )),
        }
      }
    }
  }

  /// Fetch with stale-while-revalidate strategy.
  ///
  /// A cached copy is returned at once and a background fetch refreshes the
  /// dynamic bucket for next time. Without a cached copy the caller waits for
  /// the network and gets its failure if it fails.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let key = request.cache_key();
    let bucket = self.generations.dynamic_bucket.clone();

    if let Some(cached) = self.lookup(&[bucket.as_str()], &key) {
      self.revalidate_in_background(request.clone(), key, bucket);
      return Ok(CacheResult::from_cache(
        cached.response,
        cached.cached_at,
        true,
      ));
    }

    let response = self.fetch_network(request).await?;
    store_copy(self.storage.as_ref(), &bucket, &key, &response);
    Ok(CacheResult::from_network(response))
  }

  fn revalidate_in_background(&self, request: Request, key: String, bucket: String) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let timeout = self.timeout;

    let task = async move {
      match fetch_with_timeout(network.as_ref(), &request, timeout).await {
        Ok(response) => store_copy(storage.as_ref(), &bucket, &key, &response),
        Err(e) => debug!(url = %key, "Background revalidation failed: {}", e),
      }
    };

    match self.background.lock() {
      Ok(mut tasks) => {
        // Reap finished refreshes so the set only holds work in flight
        while let Some(result) = tasks.try_join_next() {
          if let Err(e) = result {
            warn!("Background cache refresh did not finish: {}", e);
          }
        }
        tasks.spawn(task);
      }
      Err(_) => {
        warn!("Background task set poisoned, refreshing untracked");
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every background refresh started so far. Returns how many ran.
  pub async fn settle(&self) -> usize {
    let mut tasks = match self.background.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(_) => return 0,
    };

    let mut settled = 0;
    while let Some(result) = tasks.join_next().await {
      settled += 1;
      if let Err(e) = result {
        warn!("Background cache refresh did not finish: {}", e);
      }
    }
    settled
  }

  /// Cache lookup where a storage failure is just a miss.
  fn lookup(&self, buckets: &[&str], key: &str) -> Option<CachedEntry> {
    match self.storage.match_any(buckets, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %key, "Cache lookup failed, treating as miss: {}", e);
        None
      }
    }
  }
}

/// Store a response copy. Failures are logged and swallowed; the caller
/// already has its response.
fn store_copy<S: CacheStorage>(storage: &S, bucket: &str, key: &str, response: &Response) {
  // Partial content cannot be replayed from a cache
  if response.status == 206 {
    debug!(url = %key, "Not caching partial response");
    return;
  }

  if let Err(e) = storage.put_entry(bucket, key, response) {
    warn!(url = %key, bucket, "Cache write failed: {}", e);
  }
}
