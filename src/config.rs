use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Generations;
use crate::manifest::{AssetManifest, DEFAULT_STATIC_ASSETS};
use crate::outbox::BackoffPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the site is served from; static asset paths resolve against it
  pub origin: String,
  pub caches: CachesConfig,
  /// Paths or absolute URLs cached at install
  pub static_assets: Vec<String>,
  pub routing: RoutingConfig,
  pub network: NetworkConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  /// Database location (default: $XDG_DATA_HOME/vestry/cache.db)
  pub database: Option<PathBuf>,
}

/// Generation identifiers. Bump both whenever asset contents change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
  pub static_cache: String,
  pub dynamic_cache: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Substring that marks a URL as an API call
  pub api_marker: String,
  /// Extra path prefixes served network-first
  pub api_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Upper bound for one fetch; `null` disables it
  pub timeout_secs: Option<u64>,
  pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag carried by the connectivity signal; other tags are ignored
  pub tag: String,
  pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_rounds: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  /// Body used when a push arrives without a payload
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Opened (or focused) by the "explore" action
  pub root_url: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      caches: CachesConfig::default(),
      static_assets: DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
      routing: RoutingConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      database: None,
    }
  }
}

impl Default for CachesConfig {
  fn default() -> Self {
    Self {
      static_cache: "grace-church-static-v1.0.0".to_string(),
      dynamic_cache: "grace-church-dynamic-v1.0.0".to_string(),
    }
  }
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_marker: "/api/".to_string(),
      api_prefixes: Vec::new(),
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: Some(10),
      connect_timeout_secs: 5,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "background-sync".to_string(),
      backoff: BackoffConfig::default(),
    }
  }
}

impl Default for BackoffConfig {
  fn default() -> Self {
    let policy = BackoffPolicy::default();
    Self {
      initial_delay_ms: policy.initial_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
      max_rounds: policy.max_rounds,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Grace Community Church".to_string(),
      default_body: "New church notification".to_string(),
      icon: "/assets/images/icon-192.png".to_string(),
      badge: "/assets/images/badge-72.png".to_string(),
      vibrate: vec![100, 50, 100],
      root_url: "/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vestry.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vestry/config.yaml
  ///
  /// With no file anywhere the built-in defaults for the church site apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Self::default()
      }
    };
    config.check_generations();

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("vestry.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("vestry").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.caches.static_cache == config.caches.dynamic_cache {
      return Err(eyre!(
        "static_cache and dynamic_cache must differ (both are '{}')",
        config.caches.static_cache
      ));
    }
    Ok(config)
  }

  /// Warn when only one of the two generation identifiers was bumped.
  fn check_generations(&self) {
    let version = |name: &str| name.rsplit('-').next().map(str::to_string);
    let static_version = version(&self.caches.static_cache);
    let dynamic_version = version(&self.caches.dynamic_cache);
    if static_version != dynamic_version {
      tracing::warn!(
        static_cache = %self.caches.static_cache,
        dynamic_cache = %self.caches.dynamic_cache,
        "Cache generations carry different versions; bump them together"
      );
    }
  }

  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn generations(&self) -> Generations {
    Generations::new(&self.caches.static_cache, &self.caches.dynamic_cache)
  }

  pub fn manifest(&self) -> AssetManifest {
    AssetManifest::new(self.static_assets.clone())
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.network.timeout_secs.map(Duration::from_secs)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.network.connect_timeout_secs)
  }

  pub fn backoff(&self) -> BackoffPolicy {
    BackoffPolicy {
      initial_delay: Duration::from_millis(self.sync.backoff.initial_delay_ms),
      max_delay: Duration::from_millis(self.sync.backoff.max_delay_ms),
      max_rounds: self.sync.backoff.max_rounds,
    }
  }

  /// Where the cache database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  /// Get the default data directory.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("vestry"))
  }
}
