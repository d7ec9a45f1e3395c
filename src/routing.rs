//! Request classification: which caching strategy serves a GET.

use std::collections::HashSet;
use std::fmt;
use url::Url;

use crate::manifest::AssetManifest;

/// How a GET request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// A test applied to a request URL.
#[derive(Debug, Clone)]
pub enum RoutePredicate {
  /// Full URL or path equals one of the entries
  Exact(HashSet<String>),
  /// Full URL contains the marker anywhere
  Contains(String),
  /// Path starts with the prefix
  PathPrefix(String),
}

impl RoutePredicate {
  pub fn matches(&self, url: &Url) -> bool {
    match self {
      Self::Exact(entries) => entries.contains(url.as_str()) || entries.contains(url.path()),
      Self::Contains(marker) => url.as_str().contains(marker.as_str()),
      Self::PathPrefix(prefix) => url.path().starts_with(prefix.as_str()),
    }
  }
}

/// Ordered predicates; the first match wins, otherwise the fallback applies.
#[derive(Debug, Clone)]
pub struct Router {
  routes: Vec<(RoutePredicate, Strategy)>,
  fallback: Strategy,
}

impl Router {
  pub fn new(fallback: Strategy) -> Self {
    Self {
      routes: Vec::new(),
      fallback,
    }
  }

  pub fn route(mut self, predicate: RoutePredicate, strategy: Strategy) -> Self {
    self.routes.push((predicate, strategy));
    self
  }

  /// Static assets cache-first, API calls network-first, everything else
  /// stale-while-revalidate.
  pub fn for_site(manifest: &AssetManifest, api_marker: &str, api_prefixes: &[String]) -> Self {
    let exact = manifest.entries().iter().cloned().collect();

    let mut router = Self::new(Strategy::StaleWhileRevalidate)
      .route(RoutePredicate::Exact(exact), Strategy::CacheFirst)
      .route(
        RoutePredicate::Contains(api_marker.to_string()),
        Strategy::NetworkFirst,
      );
    for prefix in api_prefixes {
      router = router.route(
        RoutePredicate::PathPrefix(prefix.clone()),
        Strategy::NetworkFirst,
      );
    }
    router
  }

  pub fn classify(&self, url: &Url) -> Strategy {
    self
      .routes
      .iter()
      .find(|(predicate, _)| predicate.matches(url))
      .map(|(_, strategy)| *strategy)
      .unwrap_or(self.fallback)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn site_router() -> Router {
    Router::for_site(&AssetManifest::default(), "/api/", &["/data/".to_string()])
  }

  fn classify(url: &str) -> Strategy {
    site_router().classify(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_manifest_paths_are_cache_first() {
    assert_eq!(classify("https://church.example/"), Strategy::CacheFirst);
    assert_eq!(
      classify("https://church.example/assets/js/admin.js"),
      Strategy::CacheFirst
    );
    // Path-only match ignores the query string
    assert_eq!(
      classify("https://church.example/index.html?v=2"),
      Strategy::CacheFirst
    );
  }

  #[test]
  fn test_manifest_full_urls_are_cache_first() {
    assert_eq!(
      classify("https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.1/font/bootstrap-icons.css"),
      Strategy::CacheFirst
    );
  }

  #[test]
  fn test_api_marker_is_network_first() {
    assert_eq!(
      classify("https://church.example/api/members?page=2"),
      Strategy::NetworkFirst
    );
    assert_eq!(
      classify("https://church.example/data/offerings.json"),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    assert_eq!(
      classify("https://church.example/assets/images/logo.png"),
      Strategy::StaleWhileRevalidate
    );
    assert_eq!(
      classify("https://cdn.jsdelivr.net/npm/bootstrap@5.3.3/dist/css/bootstrap.min.css"),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_manifest_wins_over_api_marker() {
    let manifest = AssetManifest::new(vec!["/api/schema.json".to_string()]);
    let router = Router::for_site(&manifest, "/api/", &[]);
    let url = Url::parse("https://church.example/api/schema.json").unwrap();
    assert_eq!(router.classify(&url), Strategy::CacheFirst);
  }
}
