//! Queue of mutating requests made while offline, replayed on reconnect.

mod queue;
mod replay;

pub use queue::{ActionStore, NewAction, PendingAction};
pub use replay::{drain_with_backoff, replay_pending, BackoffPolicy, SyncReport};
