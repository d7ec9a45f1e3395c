//! The offline cache manager: one worker per deployed generation.
//!
//! All durable state (buckets, the pending queue, the lifecycle record) lives
//! in storage. The worker itself only holds configuration, so the host may
//! drop it between events and build a new one without losing anything.

mod lifecycle;
mod notification;

pub use lifecycle::{Lifecycle, WorkerState};
pub use notification::{handle_click, ClickOutcome, Notification};

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Generations};
use crate::config::{Config, NotificationConfig};
use crate::manifest::AssetManifest;
use crate::net::{Fetcher, Request, Response};
use crate::outbox::{replay_pending, ActionStore, NewAction, PendingAction, SyncReport};
use crate::routing::{Router, Strategy};

/// Storage a worker needs: cache buckets plus the pending-action queue.
pub trait WorkerStorage: CacheStorage + ActionStore {}

impl<T: CacheStorage + ActionStore> WorkerStorage for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  /// Number of static assets now cached
  pub cached: usize,
  /// Take over right away instead of waiting for older instances
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  /// Buckets of older generations that were deleted
  pub purged: Vec<String>,
  pub clients_claimed: bool,
}

/// How an intercepted request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// GET served by one of the caching strategies
  Strategy(Strategy),
  /// No active worker for this generation; straight to the network
  Uncontrolled,
  /// Mutating request, queued if the network is unreachable
  Outbox,
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Strategy(strategy) => write!(f, "{}", strategy),
      Self::Uncontrolled => f.write_str("uncontrolled"),
      Self::Outbox => f.write_str("outbox"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub route: Route,
  pub result: CacheResult<Response>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
  pub state: WorkerState,
  pub generations: Generations,
  /// Every bucket with its entry count
  pub buckets: Vec<(String, usize)>,
  pub pending_actions: usize,
}

/// Offline cache manager for one generation pair.
pub struct Worker<S: WorkerStorage, F: Fetcher> {
  cache: CacheLayer<S, F>,
  router: Router,
  manifest: AssetManifest,
  origin: Url,
  lifecycle: Lifecycle,
  sync_tag: String,
  notifications: NotificationConfig,
}

impl<S, F> Worker<S, F>
where
  S: WorkerStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<F>) -> Result<Self> {
    let generations = config.generations();
    let manifest = config.manifest();
    let router = Router::for_site(
      &manifest,
      &config.routing.api_marker,
      &config.routing.api_prefixes,
    );

    Ok(Self {
      cache: CacheLayer::new(storage, network, generations.clone())
        .with_timeout(config.fetch_timeout()),
      router,
      manifest,
      origin: config.origin()?,
      lifecycle: Lifecycle::new(&generations),
      sync_tag: config.sync.tag.clone(),
      notifications: config.notifications.clone(),
    })
  }

  fn storage(&self) -> &S {
    self.cache.storage()
  }

  pub fn state(&self) -> Result<WorkerState> {
    self.lifecycle.state(self.storage())
  }

  /// Populate the static bucket with every manifest asset, or with nothing.
  ///
  /// An activated worker stays activated until the new precache has
  /// succeeded, so a failed reinstall keeps serving the cached install.
  pub async fn install(&self) -> Result<InstallReport> {
    info!(bucket = %self.cache.generations().static_bucket, "Worker installing");
    let previous = self.state()?;
    let reinstall = previous == WorkerState::Activated;
    if !reinstall {
      self
        .lifecycle
        .transition(self.storage(), WorkerState::Installing)?;
    }

    match self.precache().await {
      Ok(cached) => {
        if reinstall {
          self
            .lifecycle
            .transition(self.storage(), WorkerState::Installing)?;
        }
        self
          .lifecycle
          .transition(self.storage(), WorkerState::Installed)?;
        info!(cached, "Static assets cached");
        Ok(InstallReport {
          cached,
          skip_waiting: true,
        })
      }
      Err(e) if reinstall => {
        warn!("Reinstall failed; the active install keeps serving: {}", e);
        Err(e.wrap_err("Install failed"))
      }
      Err(e) => {
        if let Err(mark) = self
          .lifecycle
          .transition(self.storage(), WorkerState::Redundant)
        {
          warn!("Could not mark failed worker redundant: {}", mark);
        }
        Err(e.wrap_err("Install failed"))
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let urls = self.manifest.resolve(&self.origin)?;

    let fetches: Vec<_> = urls
      .into_iter()
      .map(|url| async move {
        let request = Request::get(url);
        let response = self
          .cache
          .fetch_network(&request)
          .await
          .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
        if !response.is_success() {
          return Err(eyre!(
            "Failed to fetch {}: HTTP {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request.cache_key(), response))
      })
      .collect();
    let entries = futures::future::try_join_all(fetches).await?;

    self
      .storage()
      .put_all(&self.cache.generations().static_bucket, &entries)?;

    let digest = self.manifest.digest();
    if let Some(previous) = self.lifecycle.manifest_digest(self.storage())? {
      if previous != digest {
        warn!("Static asset list changed without a generation bump; clients may keep old assets");
      }
    }
    self
      .lifecycle
      .record_manifest_digest(self.storage(), &digest)?;

    Ok(entries.len())
  }

  /// Purge buckets of older generations, then take control of clients.
  pub async fn activate(&self) -> Result<ActivateReport> {
    info!("Worker activating");
    self
      .lifecycle
      .transition(self.storage(), WorkerState::Activating)
      .map_err(|e| e.wrap_err("Install must complete before activate"))?;

    let generations = self.cache.generations();
    let mut purged = Vec::new();
    for name in self.storage().bucket_names()? {
      if generations.is_current(&name) {
        continue;
      }
      info!(bucket = %name, "Deleting old cache");
      if self.storage().delete_bucket(&name)? {
        purged.push(name);
      }
    }

    self.storage().open_bucket(&generations.dynamic_bucket)?;

    self
      .lifecycle
      .transition(self.storage(), WorkerState::Activated)?;
    self.lifecycle.claim_clients(self.storage())?;

    Ok(ActivateReport {
      purged,
      clients_claimed: true,
    })
  }

  /// Produce a response for an intercepted request.
  ///
  /// Only stale-while-revalidate with an empty cache and a failed network
  /// returns an error; every other path resolves to a response.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !request.is_get() {
      let kind = format!("{} {}", request.method, request.url.path());
      let result = self.send(request, &kind).await?;
      return Ok(FetchOutcome {
        route: Route::Outbox,
        result,
      });
    }

    if self.state()? != WorkerState::Activated {
      debug!(url = %request.url, "No active worker, passing through");
      let response = self.cache.fetch_network(request).await?;
      return Ok(FetchOutcome {
        route: Route::Uncontrolled,
        result: CacheResult::from_network(response),
      });
    }

    let strategy = self.router.classify(&request.url);
    debug!(url = %request.url, %strategy, "Routing request");

    let result = match strategy {
      Strategy::CacheFirst => self.cache.cache_first(request).await,
      Strategy::NetworkFirst => self.cache.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.cache.stale_while_revalidate(request).await?,
    };

    Ok(FetchOutcome {
      route: Route::Strategy(strategy),
      result,
    })
  }

  /// Send a mutating request, queueing it if the network is unreachable.
  ///
  /// A queued request is answered with a synthetic 202 carrying its id.
  pub async fn send(&self, request: &Request, kind: &str) -> Result<CacheResult<Response>> {
    match self.cache.fetch_network(request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) if e.is_connectivity() => {
        let payload = request
          .body
          .as_deref()
          .map(serde_json::from_slice::<serde_json::Value>)
          .transpose()
          .map_err(|err| eyre!("Only JSON bodies can be queued for later: {}", err))?;

        let mut action = NewAction::new(kind, request.method.as_str(), request.url.as_str());
        if let Some(payload) = payload {
          action = action.with_payload(payload);
        }
        let queued = self.storage().push_action(&action)?;
        info!(id = queued.id, kind, "Network unavailable, action queued: {}", e);

        Ok(CacheResult::synthetic(Response::json(
          202,
          &serde_json::json!({ "queued": true, "id": queued.id }),
        )))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Connectivity came back. Replays the queue if `tag` is ours.
  pub async fn sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    if tag != self.sync_tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return Ok(None);
    }

    let report = replay_pending(self.storage(), self.cache.network(), self.cache.timeout()).await?;
    Ok(Some(report))
  }

  pub fn push(&self, payload: Option<&str>) -> Notification {
    Notification::from_push(payload, &self.notifications)
  }

  pub fn notification_click(&self, action: Option<&str>) -> Result<ClickOutcome> {
    handle_click(action, &self.notifications, &self.origin)
  }

  pub fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    self.storage().pending_actions()
  }

  pub fn remove_pending(&self, id: i64) -> Result<bool> {
    self.storage().remove_action(id)
  }

  pub fn status(&self) -> Result<WorkerStatus> {
    let buckets = self
      .storage()
      .bucket_names()?
      .into_iter()
      .map(|name| -> Result<(String, usize)> {
        let entries = self.storage().entry_keys(&name)?.len();
        Ok((name, entries))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(WorkerStatus {
      state: self.state()?,
      generations: self.cache.generations().clone(),
      buckets,
      pending_actions: self.storage().pending_actions()?.len(),
    })
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) -> usize {
    self.cache.settle().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::manifest::DEFAULT_STATIC_ASSETS;
  use crate::net::stub::StubNetwork;
  use crate::net::FetchError;
  use reqwest::Method;

  const ORIGIN: &str = "https://church.example/";

  struct Harness {
    worker: Worker<SqliteStorage, StubNetwork>,
    storage: Arc<SqliteStorage>,
    network: Arc<StubNetwork>,
  }

  fn config() -> Config {
    Config {
      origin: ORIGIN.to_string(),
      ..Config::default()
    }
  }

  fn asset_urls() -> Vec<String> {
    let origin = Url::parse(ORIGIN).unwrap();
    DEFAULT_STATIC_ASSETS
      .iter()
      .map(|a| origin.join(a).unwrap().to_string())
      .collect()
  }

  fn harness() -> Harness {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let network = Arc::new(StubNetwork::new());
    for url in asset_urls() {
      network.serve(&url, &format!("asset {}", url));
    }
    let worker = Worker::new(&config(), Arc::clone(&storage), Arc::clone(&network)).unwrap();
    Harness {
      worker,
      storage,
      network,
    }
  }

  async fn activated() -> Harness {
    let h = harness();
    h.worker.install().await.unwrap();
    h.worker.activate().await.unwrap();
    h
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_install_caches_every_asset() {
    let h = harness();
    let report = h.worker.install().await.unwrap();

    assert_eq!(report.cached, DEFAULT_STATIC_ASSETS.len());
    assert!(report.skip_waiting);
    assert_eq!(h.worker.state().unwrap(), WorkerState::Installed);
    assert_eq!(
      h.storage
        .entry_keys("grace-church-static-v1.0.0")
        .unwrap()
        .len(),
      DEFAULT_STATIC_ASSETS.len()
    );
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let h = harness();
    h.network.respond(
      "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.1/font/bootstrap-icons.css",
      Response::new(404, "gone"),
    );

    assert!(h.worker.install().await.is_err());
    assert_eq!(h.worker.state().unwrap(), WorkerState::Redundant);
    assert!(h.storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_before_install_fails() {
    let h = harness();
    assert!(h.worker.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_activate_purges_prior_generations_only() {
    let h = harness();
    for old in ["grace-church-static-v0.9.0", "grace-church-dynamic-v0.9.0"] {
      h.storage
        .put_entry(old, "https://church.example/", &Response::new(200, "old"))
        .unwrap();
    }
    h.storage.open_bucket("grace-church-dynamic-v1.0.0").unwrap();
    h.worker.install().await.unwrap();

    let report = h.worker.activate().await.unwrap();

    assert_eq!(
      report.purged,
      vec![
        "grace-church-static-v0.9.0".to_string(),
        "grace-church-dynamic-v0.9.0".to_string()
      ]
    );
    assert!(report.clients_claimed);
    assert_eq!(
      h.storage.bucket_names().unwrap(),
      vec![
        "grace-church-dynamic-v1.0.0".to_string(),
        "grace-church-static-v1.0.0".to_string()
      ]
    );
    assert_eq!(h.worker.state().unwrap(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_warm_manifest_requests_never_hit_network() {
    let h = activated().await;
    let calls_after_install = h.network.total_calls();

    for url in asset_urls() {
      let outcome = h.worker.handle_fetch(&get(&url)).await.unwrap();
      assert_eq!(outcome.route, Route::Strategy(Strategy::CacheFirst));
      assert_eq!(outcome.result.source, CacheSource::Cache);
      assert_eq!(outcome.result.data.body, format!("asset {}", url).into_bytes());
    }
    assert_eq!(h.network.total_calls(), calls_after_install);
  }

  #[tokio::test]
  async fn test_other_pages_revalidate_in_background() {
    let h = activated().await;
    let page = "https://church.example/events.html";
    h.network.serve(page, "easter schedule");

    let first = h.worker.handle_fetch(&get(page)).await.unwrap();
    assert_eq!(first.route, Route::Strategy(Strategy::StaleWhileRevalidate));
    assert_eq!(first.result.data.body, b"easter schedule");

    h.network.serve(page, "pentecost schedule");
    let second = h.worker.handle_fetch(&get(page)).await.unwrap();
    assert_eq!(second.result.data.body, b"easter schedule");

    h.worker.settle().await;
    let entry = h
      .storage
      .get_entry("grace-church-dynamic-v1.0.0", page)
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body, b"pentecost schedule");
  }

  #[tokio::test]
  async fn test_api_offline_falls_back_then_503() {
    let h = activated().await;
    let members = "https://church.example/api/members";
    h.network.serve(members, "[]");
    h.worker.handle_fetch(&get(members)).await.unwrap();

    h.network.set_online(false);
    let cached = h.worker.handle_fetch(&get(members)).await.unwrap();
    assert_eq!(cached.result.source, CacheSource::Offline);
    assert_eq!(cached.result.data.body, b"[]");

    let missing = h
      .worker
      .handle_fetch(&get("https://church.example/api/offerings"))
      .await
      .unwrap();
    assert_eq!(missing.result.data.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&missing.result.data.body).unwrap();
    assert!(body.get("error").is_some());
  }

  #[tokio::test]
  async fn test_uncontrolled_before_activation() {
    let h = harness();
    let page = "https://church.example/about.html";
    h.network.serve(page, "about");

    let outcome = h.worker.handle_fetch(&get(page)).await.unwrap();

    assert_eq!(outcome.route, Route::Uncontrolled);
    assert!(h.storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cold_page_offline_propagates_failure() {
    let h = activated().await;
    h.network.set_online(false);

    let err = h
      .worker
      .handle_fetch(&get("https://church.example/gallery.html"))
      .await
      .unwrap_err();
    assert!(err.downcast_ref::<FetchError>().is_some());
  }

  #[tokio::test]
  async fn test_offline_mutation_is_queued_and_replayed_once() {
    let h = activated().await;
    let members = "https://church.example/api/members";
    let request = Request::with_json(
      Method::POST,
      Url::parse(members).unwrap(),
      Some(&serde_json::json!({ "name": "Boaz" })),
    );

    h.network.set_online(false);
    let outcome = h.worker.handle_fetch(&request).await.unwrap();
    assert_eq!(outcome.route, Route::Outbox);
    assert_eq!(outcome.result.data.status, 202);
    let queued = h.worker.pending_actions().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, "POST /api/members");
    assert_eq!(queued[0].payload, Some(serde_json::json!({ "name": "Boaz" })));

    // Still offline: the action stays
    let report = h.worker.sync("background-sync").await.unwrap().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(h.worker.pending_actions().unwrap().len(), 1);

    h.network.set_online(true);
    h.network.respond(members, Response::new(201, "created"));
    let calls_before = h.network.calls_for(members);
    let report = h.worker.sync("background-sync").await.unwrap().unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(h.network.calls_for(members), calls_before + 1);
    assert!(h.worker.pending_actions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_ignores_foreign_tags() {
    let h = activated().await;
    assert!(h.worker.sync("periodic-refresh").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_online_mutation_passes_through() {
    let h = activated().await;
    let offerings = "https://church.example/api/offerings";
    h.network.respond(offerings, Response::new(201, "ok"));
    let request = Request::with_json(
      Method::POST,
      Url::parse(offerings).unwrap(),
      Some(&serde_json::json!({ "amount": 20 })),
    );

    let result = h.worker.send(&request, "offering.create").await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 201);
    assert!(h.worker.pending_actions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_status_reports_buckets_and_queue() {
    let h = activated().await;
    let status = h.worker.status().unwrap();

    assert_eq!(status.state, WorkerState::Activated);
    assert_eq!(
      status.buckets,
      vec![
        (
          "grace-church-static-v1.0.0".to_string(),
          DEFAULT_STATIC_ASSETS.len()
        ),
        ("grace-church-dynamic-v1.0.0".to_string(), 0),
      ]
    );
    assert_eq!(status.pending_actions, 0);
  }

  #[tokio::test]
  async fn test_failed_reinstall_keeps_serving_cached_assets() {
    let h = activated().await;
    h.network.set_online(false);

    assert!(h.worker.install().await.is_err());
    assert_eq!(h.worker.state().unwrap(), WorkerState::Activated);

    let style = "https://church.example/assets/css/style.css";
    let outcome = h.worker.handle_fetch(&get(style)).await.unwrap();
    assert_eq!(outcome.route, Route::Strategy(Strategy::CacheFirst));
    assert_eq!(outcome.result.source, CacheSource::Cache);
    assert_eq!(outcome.result.data.body, format!("asset {}", style).into_bytes());
  }

  #[tokio::test]
  async fn test_reinstall_online_moves_to_installed() {
    let h = activated().await;

    let report = h.worker.install().await.unwrap();

    assert_eq!(report.cached, DEFAULT_STATIC_ASSETS.len());
    assert_eq!(h.worker.state().unwrap(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_activate_twice_is_idempotent() {
    let h = activated().await;

    let again = h.worker.activate().await.unwrap();

    assert!(again.purged.is_empty());
    assert!(again.clients_claimed);
    assert_eq!(h.worker.state().unwrap(), WorkerState::Activated);
  }
}
