//! Sink adapters: consumers of finalized events.
//!
//! The correlation table calls [`Sink::accept`] synchronously on the
//! ingestion thread and never buffers, so a slow sink throttles ingestion.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::CorrelatorError;
use crate::types::FinalizedEvent;

pub trait Sink: Send + Sync {
  /// Deliver one finalized event. An error means the event is lost.
  fn accept(&self, event: &FinalizedEvent) -> Result<(), CorrelatorError>;

  fn start(&self) -> Result<bool, CorrelatorError>;

  fn stop(&self) -> Result<(), CorrelatorError>;
}

// ---------------------------------------------------------------------------
// JSON-lines sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SinkTarget {
  Stdout,
  File(PathBuf),
}

/// Writes one JSON object per finalized event.
///
/// Ids are not de-duplicated: an id emitted twice is written twice.
pub struct JsonLinesSink {
  target: SinkTarget,
  writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl JsonLinesSink {
  pub fn new(target: SinkTarget) -> Self {
    Self {
      target,
      writer: Mutex::new(None),
    }
  }

  pub fn stdout() -> Self {
    Self::new(SinkTarget::Stdout)
  }

  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self::new(SinkTarget::File(path.into()))
  }

  fn open(&self) -> io::Result<Box<dyn Write + Send>> {
    Ok(match &self.target {
      SinkTarget::Stdout => Box::new(io::stdout()),
      SinkTarget::File(path) => Box::new(BufWriter::new(File::create(path)?)),
    })
  }
}

impl Sink for JsonLinesSink {
  fn accept(&self, event: &FinalizedEvent) -> Result<(), CorrelatorError> {
    let mut guard = self.writer.lock();
    let out = guard
      .as_mut()
      .ok_or_else(|| CorrelatorError::sink("json-lines sink is not started"))?;
    serde_json::to_writer(&mut *out, event)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
  }

  fn start(&self) -> Result<bool, CorrelatorError> {
    let mut guard = self.writer.lock();
    if guard.is_some() {
      return Ok(false);
    }
    let writer = self
      .open()
      .map_err(|e| CorrelatorError::SinkStart(format!("{:?}: {}", self.target, e)))?;
    tracing::info!(output = ?self.target, "json-lines sink started");
    *guard = Some(writer);
    Ok(true)
  }

  fn stop(&self) -> Result<(), CorrelatorError> {
    if let Some(mut out) = self.writer.lock().take() {
      out.flush()?;
      tracing::debug!(output = ?self.target, "json-lines sink stopped");
    }
    Ok(())
  }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Records every accepted event in arrival order.
#[derive(Default)]
pub struct MemorySink {
  events: Mutex<Vec<FinalizedEvent>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<FinalizedEvent> {
    self.events.lock().clone()
  }
}

impl Sink for MemorySink {
  fn accept(&self, event: &FinalizedEvent) -> Result<(), CorrelatorError> {
    self.events.lock().push(event.clone());
    Ok(())
  }

  fn start(&self) -> Result<bool, CorrelatorError> {
    Ok(true)
  }

  fn stop(&self) -> Result<(), CorrelatorError> {
    Ok(())
  }
}
