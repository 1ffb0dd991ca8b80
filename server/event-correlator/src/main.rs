//! Binary entrypoint: correlate a JSON-lines lifecycle log into finalized
//! events.
//!
//! Each input line is one record, e.g.
//! `{"id":"scsmbstgra", "state":"STARTED", "type":"APPLICATION_LOG", "host":"12345", "timestamp":1491377495212}`.
//! Finalized events are written as JSON lines to stdout (or `--output`);
//! logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use event_correlator::{run_to_completion, Config, Controller, Retention, SinkTarget};

/// Pair STARTED/FINISHED lifecycle records and flag slow ones.
#[derive(Parser, Debug)]
#[command(name = "event-correlator")]
#[command(version, about, long_about = None)]
struct Cli {
  /// JSON-lines input file
  input: PathBuf,

  /// Write finalized events here instead of stdout
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Durations strictly above this raise the alert flag
  #[arg(long, default_value_t = 4)]
  alert_threshold: i64,

  /// Milliseconds between progress checks
  #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
  poll_interval_ms: u64,

  /// Keep completed entries in memory for the whole run
  #[arg(long)]
  retain_completed: bool,

  /// Log filter (e.g. info, debug, event_correlator=trace)
  #[arg(long, default_value = "info")]
  log_level: String,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
    .init();

  let interrupted = Arc::new(AtomicBool::new(false));
  let flag = Arc::clone(&interrupted);
  if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
    tracing::warn!(error = %e, "could not install Ctrl-C handler");
  }

  let config = Config {
    alert_threshold: cli.alert_threshold,
    retention: if cli.retain_completed {
      Retention::RetainAll
    } else {
      Retention::EvictOnDispatch
    },
    poll_interval: Duration::from_millis(cli.poll_interval_ms),
  };
  let output = match cli.output {
    Some(path) => SinkTarget::File(path),
    None => SinkTarget::Stdout,
  };

  tracing::info!(input = %cli.input.display(), "processing starting");
  let controller = Controller::json_lines(config, &cli.input, output);

  match run_to_completion(&controller, &interrupted) {
    Ok(summary) => {
      tracing::info!(
        emitted = summary.ingest.emitted,
        unpaired = summary.unpaired,
        completed = summary.completed,
        "processing finished"
      );
      if summary.completed {
        ExitCode::SUCCESS
      } else {
        ExitCode::from(130)
      }
    }
    Err(e) => {
      tracing::error!(error = %e, "processing failed");
      ExitCode::FAILURE
    }
  }
}
