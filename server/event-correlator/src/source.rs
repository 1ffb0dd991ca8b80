//! Source adapters: producers of RawRecords.
//!
//! A source owns one background ingestion thread per run. Each parsed record
//! is handed to the registered callback before the next line is read, so all
//! correlation for a run happens sequentially on that thread.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;

use crate::error::CorrelatorError;
use crate::normalize;
use crate::types::RawRecord;

/// Downstream hook invoked once per successfully parsed record.
pub type RecordCallback = Arc<dyn Fn(RawRecord) + Send + Sync>;

/// Opens the underlying line stream. Called once per `start`.
pub type LineOpener = Box<dyn Fn() -> io::Result<Box<dyn BufRead + Send>> + Send + Sync>;

pub trait Source: Send + Sync {
  /// Must be called before `start`.
  fn register_callback(&self, callback: RecordCallback);

  /// Returns false without effect if already started, or if the source could
  /// not be opened (no worker is launched in that case).
  fn start(&self) -> bool;

  /// True while the ingestion worker has not finished.
  fn has_more(&self) -> bool;

  /// Signal the worker to halt and release the source. No-op if not started.
  fn stop(&self) -> Result<(), CorrelatorError>;

  fn stats(&self) -> SourceStats {
    SourceStats::default()
  }
}

/// Line-level counters for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
  /// Non-blank lines read.
  pub lines: u64,
  /// Lines skipped because they did not parse into a record.
  pub parse_failures: u64,
}

#[derive(Default)]
struct Counters {
  lines: AtomicU64,
  parse_failures: AtomicU64,
}

impl Counters {
  fn snapshot(&self) -> SourceStats {
    SourceStats {
      lines: self.lines.load(Ordering::Relaxed),
      parse_failures: self.parse_failures.load(Ordering::Relaxed),
    }
  }
}

struct Worker {
  handle: JoinHandle<()>,
  halt: Arc<AtomicBool>,
  done: Arc<AtomicBool>,
}

#[derive(Default)]
struct SourceState {
  callback: Option<RecordCallback>,
  worker: Option<Worker>,
  counters: Arc<Counters>,
}

/// Marks the worker finished however the loop exits, including by panic.
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
  fn drop(&mut self) {
    self.0.store(true, Ordering::Release);
  }
}

// ---------------------------------------------------------------------------
// Line source
// ---------------------------------------------------------------------------

/// Reads JSON-lines records from a file (or any `BufRead`) on one worker.
pub struct LineSource {
  name: String,
  opener: LineOpener,
  state: RwLock<SourceState>,
}

impl LineSource {
  pub fn new(name: impl Into<String>, opener: LineOpener) -> Self {
    Self {
      name: name.into(),
      opener,
      state: RwLock::new(SourceState::default()),
    }
  }

  pub fn file(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let name = path.display().to_string();
    Self::new(
      name,
      Box::new(move || {
        let file = File::open(&path)?;
        Ok(Box::new(BufReader::new(file)) as Box<dyn BufRead + Send>)
      }),
    )
  }

  /// An in-memory source over `text`, replayed on every start.
  pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
    let text: String = text.into();
    Self::new(
      name,
      Box::new(move || Ok(Box::new(Cursor::new(text.clone().into_bytes())) as Box<dyn BufRead + Send>)),
    )
  }
}

impl Source for LineSource {
  fn register_callback(&self, callback: RecordCallback) {
    self.state.write().callback = Some(callback);
  }

  fn start(&self) -> bool {
    let mut state = self.state.write();
    if state.worker.is_some() {
      return false;
    }

    let callback = match &state.callback {
      Some(cb) => Arc::clone(cb),
      None => {
        tracing::error!(source = %self.name, "no callback registered; refusing to start");
        return false;
      }
    };

    let reader = match (self.opener)() {
      Ok(r) => r,
      Err(e) => {
        tracing::error!(source = %self.name, error = %e, "failed to open input");
        return false;
      }
    };

    tracing::info!(source = %self.name, "ingestion starting");

    let halt = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(Counters::default());

    let spawned = {
      let name = self.name.clone();
      let halt = Arc::clone(&halt);
      let done = Arc::clone(&done);
      let counters = Arc::clone(&counters);
      thread::Builder::new()
        .name("event-ingest".into())
        .spawn(move || {
          let _done = DoneGuard(done);
          ingest_lines(&name, reader, callback.as_ref(), &halt, &counters);
        })
    };

    match spawned {
      Ok(handle) => {
        state.worker = Some(Worker { handle, halt, done });
        state.counters = counters;
        true
      }
      Err(e) => {
        tracing::error!(source = %self.name, error = %e, "failed to spawn ingestion worker");
        false
      }
    }
  }

  fn has_more(&self) -> bool {
    self
      .state
      .read()
      .worker
      .as_ref()
      .is_some_and(|w| !w.done.load(Ordering::Acquire))
  }

  fn stop(&self) -> Result<(), CorrelatorError> {
    let mut state = self.state.write();
    let worker = match state.worker.take() {
      Some(w) => w,
      None => return Ok(()),
    };

    tracing::debug!(source = %self.name, "ingestion stopping");
    worker.halt.store(true, Ordering::Release);

    // The worker owns the reader; joining releases it. An in-flight record
    // finishes its delivery first.
    if worker.handle.join().is_err() {
      tracing::error!(source = %self.name, "ingestion worker panicked");
    }
    Ok(())
  }

  fn stats(&self) -> SourceStats {
    self.state.read().counters.snapshot()
  }
}

fn ingest_lines(
  name: &str,
  reader: Box<dyn BufRead + Send>,
  callback: &(dyn Fn(RawRecord) + Send + Sync),
  halt: &AtomicBool,
  counters: &Counters,
) {
  for (idx, line) in reader.lines().enumerate() {
    if halt.load(Ordering::Acquire) {
      tracing::info!(source = %name, "ingestion halted");
      return;
    }

    let line = match line {
      Ok(l) => l,
      Err(e) => {
        tracing::error!(source = %name, line_no = idx + 1, error = %e, "read error; ingestion ends");
        return;
      }
    };
    if line.trim().is_empty() {
      continue;
    }
    counters.lines.fetch_add(1, Ordering::Relaxed);

    match normalize::parse_line(&line) {
      Ok(record) => callback(record),
      Err(e) => {
        tracing::warn!(source = %name, line_no = idx + 1, %line, error = %e, "skipping unparsable line");
        counters.parse_failures.fetch_add(1, Ordering::Relaxed);
      }
    }
  }

  tracing::info!(source = %name, "ingestion completed");
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use std::time::{Duration, Instant};

  fn recorder() -> (RecordCallback, Arc<Mutex<Vec<RawRecord>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb: RecordCallback = Arc::new(move |r: RawRecord| sink.lock().push(r));
    (cb, seen)
  }

  fn wait_until_drained(source: &dyn Source) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.has_more() {
      assert!(Instant::now() < deadline, "source did not finish in time");
      thread::sleep(Duration::from_millis(5));
    }
  }

  #[test]
  fn broken_lines_are_skipped() {
    let text = [
      r#"{"id":"scsmbstgra", "#,
      r#"{"id":"scsmbstgrb", "state":"STARTED", "timestamp":1491377495213}"#,
      r#"345", "timestamp":1491377495217}"#,
    ]
    .join("\n");
    let source = LineSource::from_text("broken", text);
    let (cb, seen) = recorder();
    source.register_callback(cb);

    assert!(source.start());
    wait_until_drained(&source);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "scsmbstgrb");
    assert_eq!(seen[0].timestamp, 1491377495213);
    assert_eq!(seen[0].event_type, None);
    assert_eq!(seen[0].host, None);
    assert_eq!(source.stats(), SourceStats { lines: 3, parse_failures: 2 });
    source.stop().unwrap();
  }

  #[test]
  fn records_arrive_in_line_order() {
    let text = r#"{"id":"a","state":"STARTED","timestamp":1}

{"id":"b","state":"STARTED","timestamp":2}
{"id":"a","state":"FINISHED","timestamp":3}
"#;
    let source = LineSource::from_text("ordered", text);
    let (cb, seen) = recorder();
    source.register_callback(cb);
    assert!(source.start());
    wait_until_drained(&source);

    let ids: Vec<_> = seen.lock().iter().map(|r| (r.id.clone(), r.timestamp)).collect();
    assert_eq!(
      ids,
      vec![("a".to_string(), 1), ("b".to_string(), 2), ("a".to_string(), 3)]
    );
    source.stop().unwrap();
  }

  #[test]
  fn start_is_idempotent() {
    let source = LineSource::from_text("twice", r#"{"id":"a","state":"STARTED","timestamp":1}"#);
    let (cb, seen) = recorder();
    source.register_callback(cb);
    assert!(source.start());
    assert!(!source.start());
    wait_until_drained(&source);
    assert_eq!(seen.lock().len(), 1);
    source.stop().unwrap();
  }

  #[test]
  fn has_more_is_false_before_start_and_after_stop() {
    let source = LineSource::from_text("idle", "");
    assert!(!source.has_more());
    source.stop().unwrap();

    let (cb, _) = recorder();
    source.register_callback(cb);
    assert!(source.start());
    source.stop().unwrap();
    assert!(!source.has_more());
  }

  #[test]
  fn missing_file_fails_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let source = LineSource::file(dir.path().join("nope.log"));
    let (cb, _) = recorder();
    source.register_callback(cb);
    assert!(!source.start());
    assert!(!source.has_more());
  }

  #[test]
  fn start_without_callback_fails() {
    let source = LineSource::from_text("no-callback", "");
    assert!(!source.start());
  }

  #[test]
  fn reads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.log");
    std::fs::write(
      &path,
      "{\"id\":\"x\",\"state\":\"FINISHED\",\"timestamp\":5,\"host\":\"12345\"}\n",
    )
    .unwrap();

    let source = LineSource::file(&path);
    let (cb, seen) = recorder();
    source.register_callback(cb);
    assert!(source.start());
    wait_until_drained(&source);
    assert_eq!(seen.lock()[0].host.as_deref(), Some("12345"));
    source.stop().unwrap();
  }

  #[test]
  fn stop_halts_between_lines() {
    let text: String = (0..1000)
      .map(|i| format!("{{\"id\":\"id{}\",\"state\":\"STARTED\",\"timestamp\":{}}}\n", i, i))
      .collect();
    let source = LineSource::from_text("slow", text);
    let seen = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&seen);
    source.register_callback(Arc::new(move |_: RawRecord| {
      *counter.lock() += 1;
      thread::sleep(Duration::from_millis(1));
    }));

    assert!(source.start());
    thread::sleep(Duration::from_millis(20));
    source.stop().unwrap();
    assert!(!source.has_more());
    assert!(*seen.lock() < 1000);
  }
}
