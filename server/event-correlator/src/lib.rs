//! Lifecycle event correlator.
//!
//! Reads STARTED/FINISHED records from a line source, pairs them by id in an
//! in-memory correlation table, and hands each finalized event (duration +
//! alert flag) to a sink. A lifecycle controller owns the start/stop/done
//! state machine around one background ingestion worker.

pub mod config;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod normalize;
pub mod sink;
pub mod source;
pub mod types;

pub use config::{Config, Retention};
pub use controller::{run_to_completion, Controller, RunSummary};
pub use correlation::{CorrelationTable, IngestStats};
pub use error::CorrelatorError;
pub use sink::{JsonLinesSink, MemorySink, Sink, SinkTarget};
pub use source::{LineSource, RecordCallback, Source, SourceStats};
pub use types::{FinalizedEvent, Phase, RawRecord};
