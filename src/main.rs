mod cache;
mod config;
mod event;
mod lifecycle;
mod net;
mod route;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{CacheSource, CacheStorage, Partitions, SqliteStorage};
use event::{Event, EventHandler, Outcome};
use lifecycle::WorkerState;
use net::{HttpFetcher, Request};
use worker::{Intercept, Worker};

#[derive(Parser, Debug)]
#[command(name = "offline-shell")]
#[command(about = "Offline caching layer for web application shells and CDN assets")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-shell/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log more (-v info, -vv debug); RUST_LOG takes precedence
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache the application shell into the static partition
  Install,
  /// Delete partitions left over from previous deployments
  Activate,
  /// Intercept a request and print the response body
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// Dispatch a raw JSON message, e.g. '{"type":"SKIP_WAITING"}'
  Message { payload: String },
  /// Delete every partition
  Clear,
  /// List partitions and their entry counts
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(args.verbose, config.log_dir.as_deref())?;

  let storage = Arc::new(SqliteStorage::open(&config.cache_path()?)?);
  let platform = Arc::new(WorkerState::new());
  let worker = Arc::new(Worker::new(
    &config,
    storage,
    Arc::new(HttpFetcher::new()?),
    Arc::clone(&platform),
  ));

  let event = match args.command {
    Command::Install => Event::Install,
    Command::Activate => Event::Activate,
    Command::Fetch { url, method } => Event::Fetch(Request::parse(&method, &url)?),
    Command::Message { payload } => Event::Message(
      serde_json::from_str(&payload).wrap_err("Message payload is not valid JSON")?,
    ),
    Command::Clear => Event::Message(serde_json::json!({ "type": "CLEAR_CACHE" })),
    Command::Status => return print_status(worker.partitions()),
  };

  let events = EventHandler::new(Arc::clone(&worker));
  let outcome = events.dispatch(event).await?;

  // Deferred cache writes must land before the process exits
  worker.settle().await;

  report(outcome, &platform)
}

fn init_tracing(verbose: u8, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("offline_shell=warn"),
    1 => EnvFilter::new("offline_shell=info"),
    _ => EnvFilter::new("offline_shell=debug"),
  });

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offline-shell.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn report(outcome: Outcome, platform: &WorkerState) -> Result<()> {
  match outcome {
    Outcome::Installed(true) if platform.skip_waiting_requested() => {
      println!("installed; activating without waiting")
    }
    Outcome::Installed(true) => println!("installed"),
    Outcome::Installed(false) => return Err(eyre!("Install failed, static partition not populated")),
    Outcome::Activated(deleted) => {
      for name in &deleted {
        println!("deleted {}", name);
      }
      if deleted.is_empty() {
        println!("nothing to clean up");
      }
      if platform.clients_claimed() {
        println!("activated; controlling open clients");
      }
    }
    Outcome::Fetched(Intercept::PassThrough) => eprintln!("not intercepted (non-http request)"),
    Outcome::Fetched(Intercept::Respond(Ok(served))) => {
      let response = &served.response;
      eprintln!(
        "{} {} ({})",
        response.status, response.status_text, served.source
      );
      if let Some(content_type) = response.header("content-type") {
        eprintln!("content-type: {}", content_type);
      }
      if let Some(cached_at) = served.cached_at {
        eprintln!("cached at: {}", cached_at.to_rfc3339());
      }
      if served.source == CacheSource::Offline {
        eprintln!("network unreachable; served the offline placeholder");
      }
      let mut stdout = std::io::stdout().lock();
      stdout
        .write_all(&response.body)
        .and_then(|_| stdout.flush())
        .wrap_err("Failed to write response body")?;
    }
    Outcome::Fetched(Intercept::Respond(Err(e))) => {
      return Err(e.wrap_err("Request failed and no cached copy is available"))
    }
    Outcome::Handled if platform.skip_waiting_requested() => {
      println!("skip waiting requested")
    }
    Outcome::Handled => {}
  }

  Ok(())
}

fn print_status<S: CacheStorage>(partitions: &Partitions<S>) -> Result<()> {
  let names = partitions.names()?;
  if names.is_empty() {
    println!("no partitions");
    return Ok(());
  }

  let tags = partitions.tags();
  for name in names {
    let state = if tags.is_current(&name) {
      "current"
    } else if tags.is_legacy(&name) {
      "legacy"
    } else {
      "stale"
    };
    println!(
      "{:<28} {:<8} {} entries",
      name,
      state,
      partitions.entry_count(&name)?
    );
  }

  Ok(())
}
