//! Correlator configuration with sane defaults.

use std::time::Duration;

/// What happens to a correlation entry once its event has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
  /// Drop the entry after handing its event to the sink. A later record for
  /// the same id starts a fresh entry.
  #[default]
  EvictOnDispatch,
  /// Keep every entry for the lifetime of the run.
  RetainAll,
}

/// Tunables for correlation and the driving loop.
#[derive(Debug, Clone)]
pub struct Config {
  /// A finalized event raises `alert` when its duration is strictly greater.
  pub alert_threshold: i64,
  /// Entry retention after dispatch.
  pub retention: Retention,
  /// Sleep between `is_done` checks in the driving loop.
  pub poll_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      alert_threshold: 4,
      retention: Retention::EvictOnDispatch,
      poll_interval: Duration::from_millis(100),
    }
  }
}
