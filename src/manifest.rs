//! The fixed list of assets cached at install.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Assets of the church site shell, plus the pinned Bootstrap CDN files.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/assets/css/style.css",
  "/assets/js/main.js",
  "/assets/js/components.js",
  "/assets/js/admin.js",
  "/manifest.json",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/js/bootstrap.bundle.min.js",
  "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.1/font/bootstrap-icons.css",
];

/// Ordered list of static asset entries: site paths or absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
  entries: Vec<String>,
}

impl AssetManifest {
  pub fn new(entries: Vec<String>) -> Self {
    Self { entries }
  }

  pub fn entries(&self) -> &[String] {
    &self.entries
  }

  /// Absolute URLs to fetch, with paths resolved against the site origin.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
    self
      .entries
      .iter()
      .map(|entry| {
        origin
          .join(entry)
          .map_err(|e| eyre!("Invalid static asset '{}': {}", entry, e))
      })
      .collect()
  }

  /// SHA-256 over the ordered entries, hex encoded.
  ///
  /// Used to notice a changed asset list shipped without a generation bump.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for entry in &self.entries {
      hasher.update(entry.as_bytes());
      hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
  }
}

impl Default for AssetManifest {
  fn default() -> Self {
    Self::new(DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_mixes_paths_and_cdn_urls() {
    let origin = Url::parse("https://church.example").unwrap();
    let urls = AssetManifest::default().resolve(&origin).unwrap();

    assert_eq!(urls.len(), DEFAULT_STATIC_ASSETS.len());
    assert_eq!(urls[0].as_str(), "https://church.example/");
    assert_eq!(urls[2].as_str(), "https://church.example/assets/css/style.css");
    assert_eq!(
      urls[7].as_str(),
      "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css"
    );
  }

  #[test]
  fn test_digest_tracks_content_and_order() {
    let a = AssetManifest::new(vec!["/a.css".into(), "/b.js".into()]);
    let b = AssetManifest::new(vec!["/b.js".into(), "/a.css".into()]);

    assert_eq!(a.digest(), a.clone().digest());
    assert_ne!(a.digest(), b.digest());
    assert_eq!(a.digest().len(), 64);
  }
}
