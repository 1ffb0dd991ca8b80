//! Correlation table: merges partial lifecycle records by id and dispatches
//! each completed pair to the sink.
//!
//! The table is not internally synchronized. Exactly one ingestion worker
//! calls [`CorrelationTable::ingest`]; anything that feeds it from several
//! threads must wrap it in its own lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::{Config, Retention};
use crate::error::CorrelatorError;
use crate::sink::Sink;
use crate::types::*;

/// Per-run counters for the correlation side of ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
  /// Records accepted into the merge.
  pub records: u64,
  /// Records discarded before merging (no usable id).
  pub rejected: u64,
  /// Timestamp slots overwritten with a different value.
  pub conflicts: u64,
  /// Records whose merge failed unexpectedly.
  pub merge_failures: u64,
  /// Finalized events the sink accepted.
  pub emitted: u64,
  /// Finalized events lost to a sink error or panic.
  pub sink_failures: u64,
}

pub struct CorrelationTable {
  alert_threshold: i64,
  retention: Retention,
  entries: HashMap<String, CorrelationEntry>,
  sink: Arc<dyn Sink>,
  stats: IngestStats,
}

impl CorrelationTable {
  pub fn new(config: &Config, sink: Arc<dyn Sink>) -> Self {
    Self {
      alert_threshold: config.alert_threshold,
      retention: config.retention,
      entries: HashMap::new(),
      sink,
      stats: IngestStats::default(),
    }
  }

  /// Merge one record. Never fails: every problem is logged and counted so
  /// that a bad record cannot stop the run.
  pub fn ingest(&mut self, record: RawRecord) {
    if record.id.is_empty() {
      tracing::warn!(%record, "record without id ignored");
      self.stats.rejected += 1;
      return;
    }
    self.stats.records += 1;

    match self.merge(&record) {
      Ok(Some(event)) => self.dispatch(&event),
      Ok(None) => {}
      Err(e) => {
        tracing::error!(%record, error = %e, "unable to correlate record");
        self.stats.merge_failures += 1;
      }
    }
  }

  /// Returns the finalized event when this record completes its entry.
  fn merge(&mut self, record: &RawRecord) -> Result<Option<FinalizedEvent>, CorrelatorError> {
    let entry = match self.entries.entry(record.id.clone()) {
      Entry::Occupied(occupied) => occupied.into_mut(),
      Entry::Vacant(vacant) => {
        let entry = vacant.insert(CorrelationEntry::from_record(record));
        tracing::debug!(%entry, "new correlation entry");
        return Ok(None);
      }
    };

    let slot = entry.slot_mut(record.phase);
    if let Some(current) = *slot {
      if current != record.timestamp {
        tracing::warn!(
          id = %record.id,
          phase = %record.phase,
          current,
          incoming = record.timestamp,
          "conflicting timestamp; incoming value wins"
        );
        self.stats.conflicts += 1;
      }
    }
    *slot = Some(record.timestamp);

    if record.event_type.is_some() {
      entry.event_type = record.event_type.clone();
    }
    if record.host.is_some() {
      entry.host = record.host.clone();
    }

    if !entry.is_complete() {
      tracing::debug!(%entry, "entry not yet dispatchable");
      return Ok(None);
    }

    if entry.duration().is_none() {
      return Err(CorrelatorError::Merge(format!("duration overflows for {}", entry)));
    }
    let event = FinalizedEvent::from_entry(entry, self.alert_threshold);

    if self.retention == Retention::EvictOnDispatch {
      self.entries.remove(&record.id);
    }
    Ok(Some(event))
  }

  fn dispatch(&mut self, event: &FinalizedEvent) {
    let sink = &self.sink;
    match panic::catch_unwind(AssertUnwindSafe(|| sink.accept(event))) {
      Ok(Ok(())) => {
        tracing::debug!(id = %event.id, duration = ?event.duration, alert = event.alert, "event dispatched");
        self.stats.emitted += 1;
      }
      Ok(Err(e)) => {
        tracing::error!(id = %event.id, error = %e, "sink rejected event; event lost");
        self.stats.sink_failures += 1;
      }
      Err(_) => {
        tracing::error!(id = %event.id, "sink panicked; event lost");
        self.stats.sink_failures += 1;
      }
    }
  }

  /// Entries still waiting for their second phase.
  pub fn pending(&self) -> usize {
    self.entries.values().filter(|e| !e.is_complete()).count()
  }

  /// All entries currently held, complete or not.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, id: &str) -> Option<&CorrelationEntry> {
    self.entries.get(id)
  }

  pub fn stats(&self) -> IngestStats {
    self.stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sink::MemorySink;

  struct FailingSink;

  impl Sink for FailingSink {
    fn accept(&self, _event: &FinalizedEvent) -> Result<(), CorrelatorError> {
      Err(CorrelatorError::sink("disk full"))
    }
    fn start(&self) -> Result<bool, CorrelatorError> {
      Ok(true)
    }
    fn stop(&self) -> Result<(), CorrelatorError> {
      Ok(())
    }
  }

  struct PanickingSink;

  impl Sink for PanickingSink {
    fn accept(&self, _event: &FinalizedEvent) -> Result<(), CorrelatorError> {
      panic!("sink exploded");
    }
    fn start(&self) -> Result<bool, CorrelatorError> {
      Ok(true)
    }
    fn stop(&self) -> Result<(), CorrelatorError> {
      Ok(())
    }
  }

  fn table_with(config: Config) -> (CorrelationTable, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (CorrelationTable::new(&config, sink.clone()), sink)
  }

  fn table() -> (CorrelationTable, Arc<MemorySink>) {
    table_with(Config::default())
  }

  #[test]
  fn pair_in_order_emits_one_event() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("A", Phase::Started, 1491377495211));
    t.ingest(RawRecord::new("A", Phase::Finished, 1491377495212));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "A");
    assert_eq!(events[0].duration, Some(1));
    assert!(!events[0].alert);
  }

  #[test]
  fn pair_out_of_order_emits_one_event() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("B", Phase::Finished, 1491377495220));
    t.ingest(RawRecord::new("B", Phase::Started, 1491377495215));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].duration, Some(5));
    assert!(events[0].alert);
  }

  #[test]
  fn single_phase_never_emits() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("C", Phase::Started, 1491377495217));
    assert!(sink.events().is_empty());
    assert_eq!(t.pending(), 1);
  }

  #[test]
  fn repeated_phase_with_same_value_does_not_emit_or_conflict() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("C", Phase::Started, 10));
    t.ingest(RawRecord::new("C", Phase::Started, 10));
    assert!(sink.events().is_empty());
    assert_eq!(t.stats().conflicts, 0);
  }

  #[test]
  fn conflicting_timestamp_is_overwritten_and_counted() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("D", Phase::Started, 10));
    t.ingest(RawRecord::new("D", Phase::Started, 12));
    assert_eq!(t.get("D").unwrap().started, Some(12));
    assert_eq!(t.stats().conflicts, 1);

    t.ingest(RawRecord::new("D", Phase::Finished, 20));
    assert_eq!(sink.events()[0].duration, Some(8));
  }

  #[test]
  fn threshold_boundary_does_not_alert() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("E", Phase::Started, 100));
    t.ingest(RawRecord::new("E", Phase::Finished, 104));
    let events = sink.events();
    assert_eq!(events[0].duration, Some(4));
    assert!(!events[0].alert);
  }

  #[test]
  fn configured_threshold_is_used() {
    let (mut t, sink) = table_with(Config {
      alert_threshold: 0,
      ..Config::default()
    });
    t.ingest(RawRecord::new("F", Phase::Started, 100));
    t.ingest(RawRecord::new("F", Phase::Finished, 101));
    assert!(sink.events()[0].alert);
  }

  #[test]
  fn metadata_is_latest_write_wins() {
    let (mut t, sink) = table();
    t.ingest(
      RawRecord::new("G", Phase::Finished, 20)
        .with_type("OLD")
        .with_host("h1"),
    );
    t.ingest(RawRecord::new("G", Phase::Started, 10).with_host("h2"));

    let events = sink.events();
    assert_eq!(events[0].event_type.as_deref(), Some("OLD"));
    assert_eq!(events[0].host.as_deref(), Some("h2"));
  }

  #[test]
  fn record_without_id_is_rejected() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("", Phase::Started, 1));
    assert!(t.is_empty());
    assert!(sink.events().is_empty());
    assert_eq!(t.stats().rejected, 1);
    assert_eq!(t.stats().records, 0);
  }

  #[test]
  fn evict_on_dispatch_removes_completed_entry() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("H", Phase::Started, 1));
    t.ingest(RawRecord::new("H", Phase::Finished, 3));
    assert!(t.get("H").is_none());

    // A late duplicate starts a fresh, incomplete entry.
    t.ingest(RawRecord::new("H", Phase::Finished, 3));
    assert_eq!(sink.events().len(), 1);
    assert_eq!(t.pending(), 1);
  }

  #[test]
  fn retain_all_keeps_completed_entry_and_re_emits() {
    let (mut t, sink) = table_with(Config {
      retention: Retention::RetainAll,
      ..Config::default()
    });
    t.ingest(RawRecord::new("H", Phase::Started, 1));
    t.ingest(RawRecord::new("H", Phase::Finished, 3));
    assert!(t.get("H").is_some());
    assert_eq!(t.pending(), 0);

    t.ingest(RawRecord::new("H", Phase::Finished, 9));
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].duration, Some(8));
  }

  #[test]
  fn sink_error_loses_event_but_ingestion_continues() {
    let mut t = CorrelationTable::new(&Config::default(), Arc::new(FailingSink));
    t.ingest(RawRecord::new("I", Phase::Started, 1));
    t.ingest(RawRecord::new("I", Phase::Finished, 2));
    t.ingest(RawRecord::new("J", Phase::Started, 1));
    t.ingest(RawRecord::new("J", Phase::Finished, 2));

    let stats = t.stats();
    assert_eq!(stats.sink_failures, 2);
    assert_eq!(stats.emitted, 0);
    assert_eq!(stats.records, 4);
  }

  #[test]
  fn sink_panic_is_contained() {
    let mut t = CorrelationTable::new(&Config::default(), Arc::new(PanickingSink));
    t.ingest(RawRecord::new("K", Phase::Started, 1));
    t.ingest(RawRecord::new("K", Phase::Finished, 2));
    assert_eq!(t.stats().sink_failures, 1);
  }

  #[test]
  fn duration_overflow_is_a_merge_failure() {
    let (mut t, sink) = table();
    t.ingest(RawRecord::new("L", Phase::Started, i64::MIN));
    t.ingest(RawRecord::new("L", Phase::Finished, i64::MAX));
    assert!(sink.events().is_empty());
    assert_eq!(t.stats().merge_failures, 1);

    t.ingest(RawRecord::new("M", Phase::Started, 1));
    t.ingest(RawRecord::new("M", Phase::Finished, 2));
    assert_eq!(sink.events().len(), 1);
  }
}
