//! Parse input lines and normalize inbound records into RawRecords.

use crate::error::CorrelatorError;
use crate::types::*;

/// Parse one JSON input line into a validated RawRecord.
pub fn parse_line(line: &str) -> Result<RawRecord, CorrelatorError> {
  let raw: InboundRecord =
    serde_json::from_str(line.trim()).map_err(|e| CorrelatorError::parse(format!("json: {}", e)))?;
  normalize(&raw)
}

/// Validate an InboundRecord and turn it into a RawRecord.
pub fn normalize(raw: &InboundRecord) -> Result<RawRecord, CorrelatorError> {
  if raw.id.trim().is_empty() {
    return Err(CorrelatorError::parse("id: must not be empty"));
  }

  Ok(RawRecord {
    id: raw.id.clone(),
    phase: raw.state,
    timestamp: raw.timestamp,
    event_type: non_empty(raw.event_type.as_deref()),
    host: non_empty(raw.host.as_deref()),
  })
}

/// Empty metadata strings carry no information; treat them as absent.
fn non_empty(v: Option<&str>) -> Option<String> {
  v.filter(|s| !s.is_empty()).map(str::to_string)
}
