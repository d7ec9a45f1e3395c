//! Versioned cache buckets and the strategies that serve from them.
//!
//! This module provides:
//! - Named buckets holding request-URL -> response entries (SQLite-backed)
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Basic offline mode (serve cached data when the network is unavailable)

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, Generations};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::CacheResult;
#[cfg(test)]
pub use traits::CacheSource;
