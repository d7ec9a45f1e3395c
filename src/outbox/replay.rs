//! Replaying queued actions when connectivity returns.

use color_eyre::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::queue::{ActionStore, PendingAction};
use crate::net::{fetch_with_timeout, Fetcher};

/// Outcome of one connectivity signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Actions replayed successfully and removed
  pub succeeded: Vec<i64>,
  /// Actions that failed and stay queued
  pub failed: Vec<i64>,
}

impl SyncReport {
  pub fn attempted(&self) -> usize {
    self.succeeded.len() + self.failed.len()
  }

  pub fn is_drained(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Replay every queued action once, oldest first.
///
/// The queue is snapshotted up front, so actions queued while this runs wait
/// for the next signal.
pub async fn replay_pending<S, F>(
  store: &S,
  network: &F,
  timeout: Option<Duration>,
) -> Result<SyncReport>
where
  S: ActionStore,
  F: Fetcher,
{
  let actions = store.pending_actions()?;
  let mut report = SyncReport::default();

  if actions.is_empty() {
    debug!("No pending actions to replay");
    return Ok(report);
  }

  info!(count = actions.len(), "Replaying pending actions");

  for action in actions {
    match replay_one(&action, network, timeout).await {
      Ok(()) => {
        if let Err(e) = store.remove_action(action.id) {
          // It will be sent again next time, which is the lesser evil.
          warn!(id = action.id, "Replayed action could not be removed: {}", e);
        }
        report.succeeded.push(action.id);
      }
      Err(reason) => {
        warn!(id = action.id, kind = %action.kind, "Failed to sync action: {}", reason);
        if let Err(e) = store.record_failure(action.id, &reason) {
          warn!(id = action.id, "Could not record failed attempt: {}", e);
        }
        report.failed.push(action.id);
      }
    }
  }

  Ok(report)
}

async fn replay_one<F: Fetcher>(
  action: &PendingAction,
  network: &F,
  timeout: Option<Duration>,
) -> std::result::Result<(), String> {
  let request = action.to_request().map_err(|e| e.to_string())?;
  let response = fetch_with_timeout(network, &request, timeout)
    .await
    .map_err(|e| e.to_string())?;

  if response.is_success() {
    debug!(id = action.id, status = response.status, "Replayed action");
    Ok(())
  } else {
    Err(format!("server answered HTTP {}", response.status))
  }
}

/// Bounded exponential backoff between automatic replay rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  /// Extra rounds after the first one
  pub max_rounds: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(60),
      max_rounds: 5,
    }
  }
}

impl BackoffPolicy {
  /// Delay before retry number `round` (0-based).
  pub fn delay_for(&self, round: u32) -> Duration {
    let factor = 2u32.checked_pow(round).unwrap_or(u32::MAX);
    self
      .initial_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// Fire `signal` until the queue drains or the policy runs out of rounds.
///
/// Nothing is dropped from the queue when rounds run out; the remaining
/// actions wait for the next connectivity signal.
pub async fn drain_with_backoff<Sig, Fut>(
  policy: &BackoffPolicy,
  mut signal: Sig,
) -> Result<Vec<SyncReport>>
where
  Sig: FnMut() -> Fut,
  Fut: Future<Output = Result<SyncReport>>,
{
  let mut reports = vec![signal().await?];

  for round in 0..policy.max_rounds {
    if reports.last().map_or(true, SyncReport::is_drained) {
      break;
    }
    let delay = policy.delay_for(round);
    debug!(round, ?delay, "Retrying pending actions after backoff");
    tokio::time::sleep(delay).await;
    reports.push(signal().await?);
  }

  Ok(reports)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::stub::StubNetwork;
  use crate::net::Response;
  use crate::outbox::NewAction;

  const MEMBERS: &str = "https://church.example/api/members";

  fn queue_member(storage: &SqliteStorage) -> i64 {
    storage
      .push_action(
        &NewAction::new("member.create", "POST", MEMBERS)
          .with_payload(serde_json::json!({ "name": "Naomi" })),
      )
      .unwrap()
      .id
  }

  #[tokio::test]
  async fn test_success_removes_action() {
    let storage = SqliteStorage::in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond(MEMBERS, Response::new(201, "created"));
    let id = queue_member(&storage);

    let report = replay_pending(&storage, &network, None).await.unwrap();

    assert_eq!(report.succeeded, vec![id]);
    assert_eq!(network.calls_for(MEMBERS), 1);
    assert!(storage.pending_actions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failure_keeps_action_for_next_signal() {
    let storage = SqliteStorage::in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond(MEMBERS, Response::new(201, "created"));
    network.set_online(false);
    let id = queue_member(&storage);

    let report = replay_pending(&storage, &network, None).await.unwrap();
    assert_eq!(report.failed, vec![id]);
    assert_eq!(network.calls_for(MEMBERS), 1);
    let pending = storage.pending_actions().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);

    network.set_online(true);
    let report = replay_pending(&storage, &network, None).await.unwrap();
    assert_eq!(report.succeeded, vec![id]);
    assert_eq!(network.calls_for(MEMBERS), 2);
    assert!(storage.pending_actions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_server_error_counts_as_failure() {
    let storage = SqliteStorage::in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond(MEMBERS, Response::new(500, "boom"));
    queue_member(&storage);

    let report = replay_pending(&storage, &network, None).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
      storage.pending_actions().unwrap()[0].last_error.as_deref(),
      Some("server answered HTTP 500")
    );
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    let storage = SqliteStorage::in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond(MEMBERS, Response::new(200, "ok"));
    let first = queue_member(&storage);
    let second = queue_member(&storage);

    let report = replay_pending(&storage, &network, None).await.unwrap();
    assert_eq!(report.succeeded, vec![first, second]);
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = BackoffPolicy {
      initial_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
      max_rounds: 8,
    };
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    assert_eq!(policy.delay_for(4), Duration::from_secs(10));
    assert_eq!(policy.delay_for(40), Duration::from_secs(10));
  }

  #[tokio::test]
  async fn test_drain_stops_when_queue_empties() {
    let policy = BackoffPolicy {
      initial_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(2),
      max_rounds: 5,
    };
    let mut calls = 0;

    let reports = drain_with_backoff(&policy, || {
      calls += 1;
      let report = if calls < 3 {
        SyncReport {
          succeeded: vec![],
          failed: vec![1],
        }
      } else {
        SyncReport {
          succeeded: vec![1],
          failed: vec![],
        }
      };
      async move { Ok(report) }
    })
    .await
    .unwrap();

    assert_eq!(reports.len(), 3);
    assert!(reports[2].is_drained());
  }

  #[tokio::test]
  async fn test_drain_gives_up_after_max_rounds() {
    let policy = BackoffPolicy {
      initial_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(1),
      max_rounds: 2,
    };

    let reports = drain_with_backoff(&policy, || async {
      Ok(SyncReport {
        succeeded: vec![],
        failed: vec![9],
      })
    })
    .await
    .unwrap();

    assert_eq!(reports.len(), 3);
  }
}
