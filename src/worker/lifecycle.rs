//! Worker lifecycle state, persisted next to the caches it describes.

use color_eyre::{eyre::eyre, Result};
use std::fmt;

use crate::cache::{CacheStorage, Generations};

const KEY_GENERATION: &str = "worker.generation";
const KEY_STATE: &str = "worker.state";
const KEY_MANIFEST_DIGEST: &str = "worker.manifest_digest";
const KEY_CLIENTS_CLAIMED: &str = "worker.clients_claimed_at";

/// Worker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Nothing recorded for the current generation yet
  Parsed,
  Installing,
  /// Installed, waiting to activate
  Installed,
  Activating,
  /// Active and controlling requests
  Activated,
  /// Failed or replaced
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    Some(match s {
      "parsed" => Self::Parsed,
      "installing" => Self::Installing,
      "installed" => Self::Installed,
      "activating" => Self::Activating,
      "activated" => Self::Activated,
      "redundant" => Self::Redundant,
      _ => return None,
    })
  }

  /// Check if a state transition is valid.
  ///
  /// Installing may be re-entered from any settled state (a redeploy, or an
  /// install cut short), and activation may be retried after an interruption
  /// or repeated on an active worker.
  pub fn can_transition(self, to: WorkerState) -> bool {
    use WorkerState::*;

    matches!(
      (self, to),
      (Parsed | Installing | Installed | Activated | Redundant, Installing)
        | (Installing, Installed)
        | (Installed | Activating | Activated, Activating)
        | (Activating, Activated)
        | (_, Redundant)
    )
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Reads and writes the worker record for one generation pair.
///
/// A record written for another generation reads back as `Parsed`, so a
/// version bump always starts with a fresh install.
#[derive(Debug, Clone)]
pub struct Lifecycle {
  generation: String,
}

impl Lifecycle {
  pub fn new(generations: &Generations) -> Self {
    Self {
      generation: format!(
        "{}|{}",
        generations.static_bucket, generations.dynamic_bucket
      ),
    }
  }

  pub fn state<S: CacheStorage>(&self, storage: &S) -> Result<WorkerState> {
    if storage.get_meta(KEY_GENERATION)?.as_deref() != Some(self.generation.as_str()) {
      return Ok(WorkerState::Parsed);
    }

    match storage.get_meta(KEY_STATE)? {
      Some(raw) => {
        WorkerState::parse(&raw).ok_or_else(|| eyre!("Unknown worker state '{}'", raw))
      }
      None => Ok(WorkerState::Parsed),
    }
  }

  /// Move to `to`, returning the state we left.
  pub fn transition<S: CacheStorage>(&self, storage: &S, to: WorkerState) -> Result<WorkerState> {
    let from = self.state(storage)?;
    if !from.can_transition(to) {
      return Err(eyre!("Invalid worker state transition {} -> {}", from, to));
    }

    storage.set_meta(KEY_GENERATION, &self.generation)?;
    storage.set_meta(KEY_STATE, to.as_str())?;
    tracing::debug!(%from, %to, "Worker state changed");

    Ok(from)
  }

  pub fn manifest_digest<S: CacheStorage>(&self, storage: &S) -> Result<Option<String>> {
    storage.get_meta(KEY_MANIFEST_DIGEST)
  }

  pub fn record_manifest_digest<S: CacheStorage>(&self, storage: &S, digest: &str) -> Result<()> {
    storage.set_meta(KEY_MANIFEST_DIGEST, digest)
  }

  /// Take control of every client; requests are served by this generation
  /// from now on without a reload.
  pub fn claim_clients<S: CacheStorage>(&self, storage: &S) -> Result<()> {
    if self.state(storage)? != WorkerState::Activated {
      return Err(eyre!("Only an activated worker can claim clients"));
    }
    storage.set_meta(KEY_CLIENTS_CLAIMED, &chrono::Utc::now().to_rfc3339())
  }
}
