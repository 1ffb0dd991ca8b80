//! Core types for the event correlator (JSON contracts + internal models).

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// The two lifecycle points tracked per entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
  Started,
  Finished,
}

impl Phase {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Started => "STARTED",
      Self::Finished => "FINISHED",
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ---------------------------------------------------------------------------
// Inbound types (JSON contract — one object per input line)
// ---------------------------------------------------------------------------

/// One inbound line. Unknown fields are silently ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundRecord {
  pub id: String,
  pub state: Phase,
  pub timestamp: i64,
  #[serde(default, rename = "type")]
  pub event_type: Option<String>,
  #[serde(default)]
  pub host: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw record (one phase of one entity)
// ---------------------------------------------------------------------------

/// A validated record carrying exactly one phase's timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
  pub id: String,
  pub phase: Phase,
  pub timestamp: i64,
  pub event_type: Option<String>,
  pub host: Option<String>,
}

impl RawRecord {
  pub fn new(id: impl Into<String>, phase: Phase, timestamp: i64) -> Self {
    Self {
      id: id.into(),
      phase,
      timestamp,
      event_type: None,
      host: None,
    }
  }

  pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
    self.event_type = Some(event_type.into());
    self
  }

  pub fn with_host(mut self, host: impl Into<String>) -> Self {
    self.host = Some(host.into());
    self
  }
}

impl fmt::Display for RawRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "RawRecord [id={}, {}={}, type={}, host={}]",
      self.id,
      self.phase,
      self.timestamp,
      self.event_type.as_deref().unwrap_or("null"),
      self.host.as_deref().unwrap_or("null"),
    )
  }
}

// ---------------------------------------------------------------------------
// Correlation entry (per-id accumulator, owned by the table)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
  id: String,
  pub started: Option<i64>,
  pub finished: Option<i64>,
  pub event_type: Option<String>,
  pub host: Option<String>,
}

impl CorrelationEntry {
  /// Seed an entry from the first record seen for its id.
  pub fn from_record(record: &RawRecord) -> Self {
    let mut entry = Self {
      id: record.id.clone(),
      started: None,
      finished: None,
      event_type: record.event_type.clone(),
      host: record.host.clone(),
    };
    *entry.slot_mut(record.phase) = Some(record.timestamp);
    entry
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn slot_mut(&mut self, phase: Phase) -> &mut Option<i64> {
    match phase {
      Phase::Started => &mut self.started,
      Phase::Finished => &mut self.finished,
    }
  }

  pub fn is_complete(&self) -> bool {
    self.started.is_some() && self.finished.is_some()
  }

  /// `finished - started`, when both phases are known.
  pub fn duration(&self) -> Option<i64> {
    match (self.started, self.finished) {
      (Some(s), Some(f)) => f.checked_sub(s),
      _ => None,
    }
  }
}

impl fmt::Display for CorrelationEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ts = |v: Option<i64>| v.map_or_else(|| "null".to_string(), |t| t.to_string());
    write!(
      f,
      "CorrelationEntry [id={}, STARTED={}, FINISHED={}, type={}, host={}]",
      self.id,
      ts(self.started),
      ts(self.finished),
      self.event_type.as_deref().unwrap_or("null"),
      self.host.as_deref().unwrap_or("null"),
    )
  }
}

// ---------------------------------------------------------------------------
// Output types (JSON contract — what the sink receives)
// ---------------------------------------------------------------------------

/// A completed correlation, handed to the sink once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedEvent {
  pub id: String,
  pub duration: Option<i64>,
  #[serde(rename = "type")]
  pub event_type: Option<String>,
  pub host: Option<String>,
  pub alert: bool,
}

impl FinalizedEvent {
  pub fn from_entry(entry: &CorrelationEntry, alert_threshold: i64) -> Self {
    let duration = entry.duration();
    Self {
      id: entry.id().to_string(),
      duration,
      event_type: entry.event_type.clone(),
      host: entry.host.clone(),
      alert: duration.is_some_and(|d| d > alert_threshold),
    }
  }
}
