mod app;
mod cache;
mod config;
mod event;
mod http;
mod lifecycle;
mod network;
mod server;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "workout-offline")]
#[command(about = "Offline cache and write-sync proxy for the workout tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/workout-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the proxy (default)
  Serve,
  /// Replay queued writes once and exit
  Sync,
  /// Drop cache regions from older versions and exit
  Activate,
  /// List writes that exhausted their replay attempts
  DeadLetters,
  /// Put a dead letter back into the queue
  Requeue {
    /// Dead letter id
    id: i64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override listen address if specified on command line
  let config = if let Some(listen) = args.listen {
    config::Config { listen, ..config }
  } else {
    config
  };

  let _guard = init_tracing(&config)?;

  let app = app::App::new(config)?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => app.run().await?,
    Command::Sync => {
      let report = app.sync_once().await?;
      println!(
        "replayed {}, still queued {}, dead-lettered {}",
        report.replayed, report.failed, report.dead_lettered
      );
    }
    Command::Activate => {
      for region in app.activate()? {
        println!("removed {}", region);
      }
    }
    Command::DeadLetters => {
      for dead in app.dead_letters()? {
        println!(
          "{}\t{} {}\t{} bytes {}\tqueued_at={}\tattempts={}\tfailed_at={}\t{}",
          dead.id,
          dead.method,
          dead.url,
          dead.body.len(),
          dead.content_type.as_deref().unwrap_or("-"),
          dead.created_at.format("%Y-%m-%d %H:%M:%S"),
          dead.attempts,
          dead.failed_at.format("%Y-%m-%d %H:%M:%S"),
          dead.last_error
        );
      }
    }
    Command::Requeue { id } => {
      let new_id = app.requeue(id)?;
      println!("dead letter {} queued again as {}", id, new_id);
    }
  }

  Ok(())
}

/// Log to stderr, and to a daily file in the data directory when enabled.
fn init_tracing(config: &config::Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = if config.log.file {
    let dir = config::Config::data_dir()?;
    let appender = tracing_appender::rolling::daily(dir, "workout-offline.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    (
      Some(fmt::layer().with_writer(writer).with_ansi(false)),
      Some(guard),
    )
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  Ok(guard)
}
