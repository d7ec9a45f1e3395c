//! Core types for the caching system.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// A stored response together with where and when it was stored.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Bucket the entry was found in
  pub bucket: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  ///
  /// `revalidating` is set when a background refresh was started for it.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::CacheRevalidating
      } else {
        CacheSource::Cache
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// A response made up locally because nothing else was available.
  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Served from a cache bucket
  Cache,
  /// Served from cache while a background fetch refreshes it
  CacheRevalidating,
  /// Network failed, serving cached data
  Offline,
  /// Neither network nor cache could answer
  Synthetic,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::CacheRevalidating => "cache+revalidate",
      Self::Offline => "offline",
      Self::Synthetic => "synthetic",
    }
  }
}
