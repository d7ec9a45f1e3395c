//! Event host: feeds lifecycle, fetch, sync and push events to the worker.

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheResult;
use crate::net::{Fetcher, Request, Response};
use crate::outbox::{PendingAction, SyncReport};
use crate::worker::{
  ActivateReport, ClickOutcome, FetchOutcome, InstallReport, Notification, Worker, WorkerStatus,
  WorkerStorage,
};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Worker events
#[derive(Debug)]
pub enum WorkerEvent {
  /// Precache the static assets; activates right away on skip-waiting
  Install(Reply<(InstallReport, Option<ActivateReport>)>),
  Activate(Reply<ActivateReport>),
  /// An intercepted request
  Fetch {
    request: Request,
    reply: Reply<FetchOutcome>,
  },
  /// A mutating request from a client
  Send {
    request: Request,
    kind: String,
    reply: Reply<CacheResult<Response>>,
  },
  /// Connectivity came back
  Sync {
    tag: String,
    reply: Reply<Option<SyncReport>>,
  },
  Push {
    payload: Option<String>,
    reply: Reply<Notification>,
  },
  NotificationClick {
    action: Option<String>,
    reply: Reply<ClickOutcome>,
  },
  Pending(Reply<Vec<PendingAction>>),
  RemovePending {
    id: i64,
    reply: Reply<bool>,
  },
  Status(Reply<WorkerStatus>),
}

/// Runs a worker on its own task and hands it one event at a time.
///
/// Every event is awaited to completion before the next one is taken. When
/// the last handle is dropped the host waits for background refreshes before
/// it stops.
pub struct WorkerHost {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  task: JoinHandle<()>,
}

impl WorkerHost {
  pub fn spawn<S, F>(worker: Worker<S, F>) -> Self
  where
    S: WorkerStorage + 'static,
    F: Fetcher + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        dispatch(&worker, event).await;
      }

      let settled = worker.settle().await;
      info!(settled, "Worker host stopped");
    });

    Self { tx, task }
  }

  async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> WorkerEvent) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(make(reply))
      .map_err(|_| eyre!("Worker host has stopped"))?;
    rx.await.map_err(|_| eyre!("Worker host has stopped"))?
  }

  pub async fn install(&self) -> Result<(InstallReport, Option<ActivateReport>)> {
    self.request(WorkerEvent::Install).await
  }

  pub async fn activate(&self) -> Result<ActivateReport> {
    self.request(WorkerEvent::Activate).await
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    self
      .request(|reply| WorkerEvent::Fetch { request, reply })
      .await
  }

  pub async fn send(&self, request: Request, kind: String) -> Result<CacheResult<Response>> {
    self
      .request(|reply| WorkerEvent::Send {
        request,
        kind,
        reply,
      })
      .await
  }

  pub async fn sync(&self, tag: String) -> Result<Option<SyncReport>> {
    self.request(|reply| WorkerEvent::Sync { tag, reply }).await
  }

  pub async fn push(&self, payload: Option<String>) -> Result<Notification> {
    self
      .request(|reply| WorkerEvent::Push { payload, reply })
      .await
  }

  pub async fn notification_click(&self, action: Option<String>) -> Result<ClickOutcome> {
    self
      .request(|reply| WorkerEvent::NotificationClick { action, reply })
      .await
  }

  pub async fn pending(&self) -> Result<Vec<PendingAction>> {
    self.request(WorkerEvent::Pending).await
  }

  pub async fn remove_pending(&self, id: i64) -> Result<bool> {
    self
      .request(|reply| WorkerEvent::RemovePending { id, reply })
      .await
  }

  pub async fn status(&self) -> Result<WorkerStatus> {
    self.request(WorkerEvent::Status).await
  }

  /// Stop taking events and wait until background work has finished.
  pub async fn shutdown(self) -> Result<()> {
    drop(self.tx);
    self
      .task
      .await
      .map_err(|e| eyre!("Worker host did not shut down cleanly: {}", e))
  }
}

async fn dispatch<S, F>(worker: &Worker<S, F>, event: WorkerEvent)
where
  S: WorkerStorage + 'static,
  F: Fetcher + 'static,
{
  // A closed reply channel only means the caller stopped waiting.
  match event {
    WorkerEvent::Install(reply) => {
      let _ = reply.send(install(worker).await);
    }
    WorkerEvent::Activate(reply) => {
      let _ = reply.send(worker.activate().await);
    }
    WorkerEvent::Fetch { request, reply } => {
      let _ = reply.send(worker.handle_fetch(&request).await);
    }
    WorkerEvent::Send {
      request,
      kind,
      reply,
    } => {
      let _ = reply.send(worker.send(&request, &kind).await);
    }
    WorkerEvent::Sync { tag, reply } => {
      let _ = reply.send(worker.sync(&tag).await);
    }
    WorkerEvent::Push { payload, reply } => {
      let _ = reply.send(Ok(worker.push(payload.as_deref())));
    }
    WorkerEvent::NotificationClick { action, reply } => {
      let _ = reply.send(worker.notification_click(action.as_deref()));
    }
    WorkerEvent::Pending(reply) => {
      let _ = reply.send(worker.pending_actions());
    }
    WorkerEvent::RemovePending { id, reply } => {
      let _ = reply.send(worker.remove_pending(id));
    }
    WorkerEvent::Status(reply) => {
      let _ = reply.send(worker.status());
    }
  }
}

async fn install<S, F>(worker: &Worker<S, F>) -> Result<(InstallReport, Option<ActivateReport>)>
where
  S: WorkerStorage + 'static,
  F: Fetcher + 'static,
{
  let report = worker.install().await?;
  if !report.skip_waiting {
    return Ok((report, None));
  }

  debug!("Skipping the waiting phase");
  let activated = worker.activate().await?;
  Ok((report, Some(activated)))
}
