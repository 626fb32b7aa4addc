mod agent;
mod cache;
mod config;
mod event;
mod http;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agent::host::{ClientHandle, Host, LocalHost};
use agent::Agent;
use cache::{CacheSource, SqliteStorage};
use config::{Config, LogConfig};
use event::{EventDispatcher, TokioSpawner};
use http::client::HttpClient;
use http::types::Request;

#[derive(Parser, Debug)]
#[command(name = "tracker-agent")]
#[command(about = "Offline-support agent for the GPS tracker page")]
#[command(version)]
struct Args {
  /// Path to config file
  /// (default: ./tracker-agent.yaml, then $XDG_CONFIG_HOME/tracker-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured cache version and activate it
  Install,
  /// Remove every cache version except the configured one
  Activate,
  /// Fetch a URL network-first, falling back to the cache
  Fetch {
    url: String,
    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// List cache versions in the store
  Caches,
  /// List entries of the current cache version
  Entries,
  /// Trigger a background sync
  Sync {
    /// Sync tag (default: the configured location tag)
    tag: Option<String>,
  },
  /// Trigger a periodic background sync
  PeriodicSync {
    /// Sync tag (default: the configured periodic tag)
    tag: Option<String>,
  },
  /// Deliver a push message and show the resulting notification
  Push {
    /// Push payload text
    payload: Option<String>,
  },
  /// Click the tracking notification
  Click,
  /// Post a JSON message from a page, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = init_logging(&config.log, args.verbose)?;

  let storage = SqliteStorage::open(config.cache.path.as_deref())?;
  let network = Arc::new(HttpClient::new()?);
  let host = Arc::new(LocalHost::new());
  let spawner = TokioSpawner::default();

  let agent = Arc::new(Agent::new(
    config.clone(),
    storage,
    network,
    host.clone(),
    Arc::new(spawner.clone()),
  ));
  let (dispatcher, events) = EventDispatcher::channel();
  host.attach(dispatcher.clone())?;
  tokio::spawn(Arc::clone(&agent).run(events));

  let result = run(args.command, &config, &agent, &host, &dispatcher).await;

  // Let detached cache writes land before exiting
  spawner.drain().await;

  result
}

async fn run(
  command: Command,
  config: &Config,
  agent: &Agent<SqliteStorage>,
  host: &LocalHost,
  dispatcher: &EventDispatcher,
) -> Result<()> {
  let mut out = std::io::stdout();

  match command {
    Command::Install => {
      host.register(&config.cache.version).await?;
      let registration = host.registration()?;
      match (&registration.active, &registration.waiting) {
        (Some(active), _) if active.version == config.cache.version => {
          writeln!(out, "{} installed and active", active.version)?;
        }
        (_, Some(waiting)) => writeln!(out, "{} installed, waiting", waiting.version)?,
        _ => writeln!(out, "{} installed", config.cache.version)?,
      }
      for entry in agent.cache().entries()? {
        writeln!(out, "  {} {}", entry.response.status, entry.description)?;
      }
    }
    Command::Activate => {
      dispatcher.activate().await?;
      writeln!(out, "{}", agent.cache().keys()?.join("\n"))?;
    }
    Command::Fetch {
      url,
      method,
      headers,
    } => {
      let mut request = Request::get(config.resolve(&url)?).with_method(method);
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header {:?}, expected `Name: value`", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let result = dispatcher.fetch(request).await?;
      match (result.source, result.cached_at) {
        (CacheSource::Offline, Some(cached_at)) => writeln!(
          out,
          "{} (from {}, cached {})",
          result.data.status, result.source, cached_at
        )?,
        _ => writeln!(out, "{} (from {})", result.data.status, result.source)?,
      }
      for (name, value) in &result.data.headers {
        writeln!(out, "{}: {}", name, value)?;
      }
      writeln!(out)?;
      out.write_all(&result.data.body)?;
      out.flush()?;
    }
    Command::Caches => {
      for name in agent.cache().keys()? {
        let marker = if name == config.cache.version { "*" } else { " " };
        writeln!(out, "{} {}", marker, name)?;
      }
    }
    Command::Entries => {
      for entry in agent.cache().entries()? {
        writeln!(
          out,
          "{} {} {} bytes, cached {}",
          entry.response.status,
          entry.description,
          entry.response.body.len(),
          entry.cached_at
        )?;
      }
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.location_tag.clone());
      let mut page = open_tracker_page(config, host).await?;
      dispatcher.sync(tag).await?;
      print_page_messages(&mut out, &mut page)?;
      host.disconnect(page.id).await?;
    }
    Command::PeriodicSync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.periodic_tag.clone());
      let mut page = open_tracker_page(config, host).await?;
      dispatcher.periodic_sync(tag).await?;
      print_page_messages(&mut out, &mut page)?;
      host.disconnect(page.id).await?;
    }
    Command::Push { payload } => {
      dispatcher.push(payload).await?;
      for notification in host.notifications()? {
        writeln!(out, "{}", serde_json::to_string_pretty(&notification)?)?;
      }
    }
    Command::Click => {
      dispatcher
        .notification_click(Some(config.notifications.tag.clone()))
        .await?;
      for id in host.focused_clients()? {
        writeln!(out, "focused client {}", id)?;
      }
      for url in host.opened_windows()? {
        writeln!(out, "opened {}", url)?;
      }
    }
    Command::Message { json } => {
      let data: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid message JSON: {}", e))?;
      dispatcher.message(data).await?;
    }
  }

  Ok(())
}

/// Connect a controlled tracker page so relayed messages have a receiver.
async fn open_tracker_page(config: &Config, host: &LocalHost) -> Result<ClientHandle> {
  let page = host.connect(config.resolve(&config.notifications.open_url)?)?;
  host.claim_clients().await?;
  Ok(page)
}

fn print_page_messages(out: &mut impl Write, page: &mut ClientHandle) -> Result<()> {
  while let Ok(message) = page.messages.try_recv() {
    writeln!(out, "page {} <- {}", page.id, serde_json::to_string(&message)?)?;
  }
  Ok(())
}

fn init_logging(config: &LogConfig, verbose: u8) -> Result<Option<WorkerGuard>> {
  let default_filter = match verbose {
    0 => "tracker_agent=warn",
    1 => "tracker_agent=info",
    _ => "tracker_agent=debug",
  };
  let filter = EnvFilter::try_from_env("TRACKER_AGENT_LOG")
    .unwrap_or_else(|_| EnvFilter::new(default_filter));

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

      Ok(None)
    }
  }
}
