//! Structured error types for the event correlator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorrelatorError {
  #[error("config: {0}")]
  Config(String),

  #[error("source start: {0}")]
  SourceStart(String),

  #[error("sink start: {0}")]
  SinkStart(String),

  #[error("parse: {reason}")]
  Parse { reason: String },

  #[error("merge: {0}")]
  Merge(String),

  #[error("sink: {0}")]
  Sink(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl CorrelatorError {
  pub fn config(msg: impl Into<String>) -> Self {
    Self::Config(msg.into())
  }

  pub fn parse(reason: impl Into<String>) -> Self {
    Self::Parse {
      reason: reason.into(),
    }
  }

  pub fn sink(msg: impl Into<String>) -> Self {
    Self::Sink(msg.into())
  }
}
