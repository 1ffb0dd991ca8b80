//! Lifecycle controller: wires Source → CorrelationTable → Sink and owns the
//! start/stop/done state machine.
//!
//! `start` and `stop` take the write half of one lock, `is_done` the read
//! half, so the public surface may be called from any thread.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::Config;
use crate::correlation::{CorrelationTable, IngestStats};
use crate::error::CorrelatorError;
use crate::sink::{JsonLinesSink, Sink, SinkTarget};
use crate::source::{LineSource, Source, SourceStats};
use crate::types::RawRecord;

pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn Source>, CorrelatorError> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn() -> Result<Arc<dyn Sink>, CorrelatorError> + Send + Sync>;

/// What one run did, captured when the controller stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub source: SourceStats,
  pub ingest: IngestStats,
  /// Entries still missing a phase when the run ended.
  pub unpaired: usize,
  /// The source had drained its input before the stop.
  pub completed: bool,
}

#[derive(Default)]
struct ControllerState {
  started: bool,
  source: Option<Box<dyn Source>>,
  sink: Option<Arc<dyn Sink>>,
  table: Option<Arc<Mutex<CorrelationTable>>>,
  last_run: Option<RunSummary>,
}

pub struct Controller {
  config: Config,
  source_factory: SourceFactory,
  sink_factory: SinkFactory,
  state: RwLock<ControllerState>,
}

impl Controller {
  pub fn new(config: Config, source_factory: SourceFactory, sink_factory: SinkFactory) -> Self {
    Self {
      config,
      source_factory,
      sink_factory,
      state: RwLock::new(ControllerState::default()),
    }
  }

  /// A controller reading `input` as JSON lines and writing finalized events
  /// as JSON lines to `output`.
  pub fn json_lines(config: Config, input: impl Into<PathBuf>, output: SinkTarget) -> Self {
    let input = input.into();
    Self::new(
      config,
      Box::new(move || Ok(Box::new(LineSource::file(input.clone())) as Box<dyn Source>)),
      Box::new(move || Ok(Arc::new(JsonLinesSink::new(output.clone())) as Arc<dyn Sink>)),
    )
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Returns `Ok(false)` if already started. On failure every adapter that
  /// was brought up is torn down again and the controller stays stopped.
  pub fn start(&self) -> Result<bool, CorrelatorError> {
    let mut state = self.state.write();
    if state.started {
      tracing::debug!("start requested on a controller that is already started");
      return Ok(false);
    }

    tracing::info!("controller starting");
    match self.bring_up(&mut state) {
      Ok(()) => {
        state.started = true;
        tracing::info!("controller started");
        Ok(true)
      }
      Err(e) => {
        tracing::error!(error = %e, "controller failed to start; rolling back");
        teardown(&mut state);
        Err(e)
      }
    }
  }

  fn bring_up(&self, state: &mut ControllerState) -> Result<(), CorrelatorError> {
    let source = state.source.insert((self.source_factory)()?);
    let sink = (self.sink_factory)()?;
    state.sink = Some(Arc::clone(&sink));

    let table = Arc::new(Mutex::new(CorrelationTable::new(&self.config, Arc::clone(&sink))));
    state.table = Some(Arc::clone(&table));

    let gate = Arc::new(StartGate::new());
    let ingest_table = Arc::clone(&table);
    let ingest_gate = Arc::clone(&gate);
    source.register_callback(Arc::new(move |record: RawRecord| {
      if let Some(record) = ingest_gate.admit(record) {
        ingest_table.lock().ingest(record);
      }
    }));

    let started = start_adapters(&**source, &*sink, &table, &gate);
    if started.is_err() {
      gate.settle(GateState::Aborted);
    }
    started
  }

  /// Tears both adapters down. Teardown failures are logged, never returned.
  pub fn stop(&self) {
    let mut state = self.state.write();
    if !state.started {
      tracing::debug!("stop requested on a controller that is already stopped");
      return;
    }

    tracing::info!("controller stopping");
    let completed = state.source.as_ref().is_some_and(|s| !s.has_more());
    let summary = teardown(&mut state).map(|mut s| {
      s.completed = completed;
      s
    });

    if let Some(s) = &summary {
      tracing::info!(
        lines = s.source.lines,
        parse_failures = s.source.parse_failures,
        records = s.ingest.records,
        rejected = s.ingest.rejected,
        conflicts = s.ingest.conflicts,
        merge_failures = s.ingest.merge_failures,
        emitted = s.ingest.emitted,
        sink_failures = s.ingest.sink_failures,
        unpaired = s.unpaired,
        completed = s.completed,
        "run summary"
      );
      if s.unpaired > 0 {
        tracing::warn!(unpaired = s.unpaired, "run ended with unpaired entries");
      }
    }

    state.last_run = summary;
    state.started = false;
  }

  /// True when no source is held or the held source has drained.
  pub fn is_done(&self) -> bool {
    self.state.read().source.as_ref().map_or(true, |s| !s.has_more())
  }

  pub fn is_started(&self) -> bool {
    self.state.read().started
  }

  /// Summary of the most recently stopped run.
  pub fn last_run(&self) -> Option<RunSummary> {
    self.state.read().last_run
  }
}

/// Source first, then sink. Records that arrived in between are ingested
/// once the sink is up, before the gate lets any other thread through.
fn start_adapters(
  source: &dyn Source,
  sink: &dyn Sink,
  table: &Mutex<CorrelationTable>,
  gate: &StartGate,
) -> Result<(), CorrelatorError> {
  if !source.start() {
    return Err(CorrelatorError::SourceStart("source refused to start".into()));
  }
  if !sink.start()? {
    tracing::debug!("sink was already running");
  }

  let early = gate.take_early();
  if !early.is_empty() {
    tracing::debug!(count = early.len(), "ingesting records delivered during start");
    let mut table = table.lock();
    for record in early {
      table.ingest(record);
    }
  }
  gate.settle(GateState::Open);
  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
  Closed,
  Open,
  Aborted,
}

/// Keeps records away from the sink until it has started.
///
/// A source may deliver on the thread running `start` (inside
/// `Source::start`) or on its own worker. The former are queued and ingested
/// by `start_adapters`; the latter block until the gate settles. Nothing here
/// is held while foreign code runs on the starting thread.
struct StartGate {
  starter: ThreadId,
  state: Mutex<GateState>,
  settled: Condvar,
  early: Mutex<Vec<RawRecord>>,
}

impl StartGate {
  fn new() -> Self {
    Self {
      starter: thread::current().id(),
      state: Mutex::new(GateState::Closed),
      settled: Condvar::new(),
      early: Mutex::new(Vec::new()),
    }
  }

  /// Returns the record when it may be ingested right away.
  fn admit(&self, record: RawRecord) -> Option<RawRecord> {
    let mut state = self.state.lock();
    if *state == GateState::Closed && thread::current().id() == self.starter {
      self.early.lock().push(record);
      return None;
    }
    while *state == GateState::Closed {
      self.settled.wait(&mut state);
    }
    match *state {
      GateState::Open => Some(record),
      _ => {
        tracing::debug!(%record, "start was aborted; record dropped");
        None
      }
    }
  }

  fn take_early(&self) -> Vec<RawRecord> {
    std::mem::take(&mut *self.early.lock())
  }

  fn settle(&self, to: GateState) {
    *self.state.lock() = to;
    self.settled.notify_all();
  }
}

/// Stop source then sink, each independently, and drop the run's table.
/// Returns the run's counters when a table was in place.
fn teardown(state: &mut ControllerState) -> Option<RunSummary> {
  let mut source_stats = SourceStats::default();

  if let Some(source) = state.source.take() {
    quietly("source", || source.stop());
    source_stats = source.stats();
  }
  if let Some(sink) = state.sink.take() {
    quietly("sink", || sink.stop());
  }

  // The worker has been joined, so the table is quiescent.
  state.table.take().map(|table| {
    let table = table.lock();
    RunSummary {
      source: source_stats,
      ingest: table.stats(),
      unpaired: table.pending(),
      completed: false,
    }
  })
}

fn quietly(what: &str, f: impl FnOnce() -> Result<(), CorrelatorError>) {
  match panic::catch_unwind(AssertUnwindSafe(f)) {
    Ok(Ok(())) => {}
    Ok(Err(e)) => tracing::error!(adapter = what, error = %e, "error while stopping"),
    Err(_) => tracing::error!(adapter = what, "panic while stopping"),
  }
}

/// Start the controller, poll until the input is drained or `interrupted` is
/// raised, then stop it regardless of how polling ended.
pub fn run_to_completion(
  controller: &Controller,
  interrupted: &AtomicBool,
) -> Result<RunSummary, CorrelatorError> {
  let polled = poll_until_done(controller, interrupted);

  controller.stop();

  polled?;
  Ok(controller.last_run().unwrap_or_default())
}

fn poll_until_done(controller: &Controller, interrupted: &AtomicBool) -> Result<(), CorrelatorError> {
  controller.start()?;
  while !controller.is_done() {
    if interrupted.load(Ordering::Relaxed) {
      tracing::warn!("interrupted before input was drained");
      break;
    }
    thread::sleep(controller.config().poll_interval);
  }
  Ok(())
}
