//! Pending-action records and the store that keeps them.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use url::Url;

use crate::net::Request;

/// A mutating request waiting to be queued.
#[derive(Debug, Clone)]
pub struct NewAction {
  /// What the action means to the site (e.g. "member.create")
  pub kind: String,
  pub method: String,
  pub url: String,
  pub payload: Option<serde_json::Value>,
}

impl NewAction {
  pub fn new(kind: &str, method: &str, url: &str) -> Self {
    Self {
      kind: kind.to_string(),
      method: method.to_string(),
      url: url.to_string(),
      payload: None,
    }
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = Some(payload);
    self
  }
}

/// A queued action, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAction {
  pub id: i64,
  pub kind: String,
  pub method: String,
  pub url: String,
  pub payload: Option<serde_json::Value>,
  /// Replay attempts that have failed so far
  pub attempts: u32,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl PendingAction {
  /// Rebuild the network request this action stands for.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Action {} has invalid method {}: {}", self.id, self.method, e))?;
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Action {} has invalid url {}: {}", self.id, self.url, e))?;

    Ok(Request::with_json(method, url, self.payload.as_ref()))
  }
}

/// Durable FIFO of pending actions.
pub trait ActionStore: Send + Sync {
  /// Append an action; it receives the next identifier.
  fn push_action(&self, action: &NewAction) -> Result<PendingAction>;

  fn get_action(&self, id: i64) -> Result<Option<PendingAction>>;

  /// Every pending action, oldest first.
  fn pending_actions(&self) -> Result<Vec<PendingAction>>;

  /// Remove an action permanently. Returns false if it was already gone.
  fn remove_action(&self, id: i64) -> Result<bool>;

  /// Count a failed replay attempt and remember why it failed.
  fn record_failure(&self, id: i64, error: &str) -> Result<()>;
}
