mod cache;
mod config;
mod event;
mod manifest;
mod net;
mod outbox;
mod routing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use cache::SqliteStorage;
use event::WorkerHost;
use net::{HttpFetcher, Request};
use outbox::{drain_with_backoff, SyncReport};
use worker::{ClickOutcome, Worker};

#[derive(Parser, Debug)]
#[command(name = "vestry")]
#[command(about = "Offline cache manager for the Grace Community Church site")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./vestry.yaml, then $XDG_CONFIG_HOME/vestry/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep everything in memory; nothing survives the process
  #[arg(long)]
  ephemeral: bool,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the static assets and take over right away
  Install,
  /// Purge old generations and claim clients
  Activate,
  /// Run GET requests through the worker
  Fetch {
    /// Absolute URLs or paths relative to the origin
    #[arg(required = true)]
    urls: Vec<String>,
    /// Print response bodies
    #[arg(long)]
    body: bool,
  },
  /// Send a mutating request, queueing it while offline
  Send {
    method: String,
    url: String,
    /// JSON payload
    #[arg(short, long)]
    data: Option<String>,
    /// Label stored with a queued action (default: "<METHOD> <path>")
    #[arg(short, long)]
    kind: Option<String>,
  },
  /// Signal that connectivity is back and replay the queue
  Sync {
    /// Sync tag (default: the configured tag)
    #[arg(short, long)]
    tag: Option<String>,
    /// Keep retrying with backoff until the queue drains
    #[arg(long)]
    retry: bool,
  },
  /// Inspect or prune the pending-action queue
  Queue {
    #[command(subcommand)]
    action: QueueCommand,
  },
  /// Deliver a push message and print the notification it produces
  Push { payload: Option<String> },
  /// Click a notification, optionally on one of its actions
  Click { action: Option<String> },
  /// Show worker state, buckets and queue size
  Status,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Remove { id: i64 },
}

/// Log to a daily file under the data directory, and to stderr with `--verbose`.
///
/// The filter comes from `VESTRY_LOG` (default: info).
fn init_tracing(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = config::Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "vestry.log"));
  let filter = EnvFilter::try_from_env("VESTRY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;
  let origin = config.origin()?;

  let storage = if args.ephemeral {
    SqliteStorage::in_memory()?
  } else {
    SqliteStorage::open(&config.database_path()?)?
  };
  let network = HttpFetcher::new(config.connect_timeout())?;
  let worker = Worker::new(&config, Arc::new(storage), Arc::new(network))?;
  let host = WorkerHost::spawn(worker);

  info!(command = ?args.command, "vestry starting");
  let result = run(&host, &config, &origin, args.command).await;
  host.shutdown().await?;
  result
}

async fn run(
  host: &WorkerHost,
  config: &config::Config,
  origin: &Url,
  command: Command,
) -> Result<()> {
  match command {
    Command::Install => {
      let (installed, activated) = host.install().await?;
      println!("Installed {} static assets", installed.cached);
      if let Some(activated) = activated {
        print_activation(&activated);
      }
    }
    Command::Activate => {
      let activated = host.activate().await?;
      print_activation(&activated);
    }
    Command::Fetch { urls, body } => {
      for raw in urls {
        let url = resolve(origin, &raw)?;
        match host.fetch(Request::get(url.clone())).await {
          Ok(outcome) => {
            let response = &outcome.result.data;
            println!(
              "{} {} [{}, {}]",
              response.status,
              url,
              outcome.route,
              outcome.result.source.as_str()
            );
            if let Some(cached_at) = outcome.result.cached_at {
              println!("  cached {}", cached_at.format("%Y-%m-%d %H:%M:%S"));
            }
            if body {
              if let Some(content_type) = response.header("content-type") {
                println!("content-type: {}", content_type);
              }
              println!("{}", String::from_utf8_lossy(&response.body));
            }
          }
          Err(e) => println!("ERR {} {}", url, e),
        }
      }
    }
    Command::Send {
      method,
      url,
      data,
      kind,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      if method == Method::GET {
        return Err(eyre!("Use `fetch` for GET requests"));
      }
      let url = resolve(origin, &url)?;
      let payload = data
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("--data must be JSON: {}", e))?;

      let kind = kind.unwrap_or_else(|| format!("{} {}", method, url.path()));
      let request = Request::with_json(method, url, payload.as_ref());
      let result = host.send(request, kind).await?;
      println!(
        "{} [{}]\n{}",
        result.data.status,
        result.source.as_str(),
        String::from_utf8_lossy(&result.data.body)
      );
    }
    Command::Sync { tag, retry } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      if retry {
        let reports = drain_with_backoff(&config.backoff(), || {
          let tag = tag.clone();
          async move { Ok(host.sync(tag).await?.unwrap_or_default()) }
        })
        .await?;
        for (round, report) in reports.iter().enumerate() {
          print_sync(round, report);
        }
      } else {
        match host.sync(tag.clone()).await? {
          Some(report) => print_sync(0, &report),
          None => println!("Ignored sync for unknown tag '{}'", tag),
        }
      }
    }
    Command::Queue { action } => match action {
      QueueCommand::List => {
        let pending = host.pending().await?;
        if pending.is_empty() {
          println!("No pending actions");
        }
        for action in pending {
          println!(
            "#{} {} {} {} (attempts: {}, queued {})",
            action.id,
            action.kind,
            action.method,
            action.url,
            action.attempts,
            action.created_at.format("%Y-%m-%d %H:%M:%S")
          );
          if let Some(error) = action.last_error {
            println!("    last error: {}", error);
          }
        }
      }
      QueueCommand::Remove { id } => {
        if host.remove_pending(id).await? {
          println!("Removed action #{}", id);
        } else {
          println!("No pending action #{}", id);
        }
      }
    },
    Command::Push { payload } => {
      let notification = host.push(payload).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Click { action } => match host.notification_click(action).await? {
      ClickOutcome::OpenOrFocus(url) => println!("Open or focus {}", url),
      ClickOutcome::Dismiss => println!("Dismissed"),
    },
    Command::Status => {
      let status = host.status().await?;
      println!("State:    {}", status.state);
      println!("Static:   {}", status.generations.static_bucket);
      println!("Dynamic:  {}", status.generations.dynamic_bucket);
      for (bucket, entries) in status.buckets {
        println!("  {:<40} {} entries", bucket, entries);
      }
      println!("Pending:  {}", status.pending_actions);
    }
  }

  Ok(())
}

/// Accept an absolute URL or a path relative to the origin.
fn resolve(origin: &Url, raw: &str) -> Result<Url> {
  origin
    .join(raw)
    .map_err(|e| eyre!("Invalid URL '{}': {}", raw, e))
}

fn print_activation(report: &worker::ActivateReport) {
  if report.purged.is_empty() {
    println!("Activated; no old caches to delete");
  } else {
    println!("Activated; deleted {}", report.purged.join(", "));
  }
}

fn print_sync(round: usize, report: &SyncReport) {
  println!(
    "Round {}: {} of {} replayed, {} still pending",
    round + 1,
    report.succeeded.len(),
    report.attempted(),
    report.failed.len()
  );
}
