use std::io::{BufRead, Write};

use serde_json::{json, Map, Value};

use crate::canon;
use crate::digest;
use crate::error::ObserverError;
use crate::event::{GATEWAY_ARTIFACT, GATEWAY_SOURCE};

const RAW_KEYS: [&str; 4] = ["event_id", "source", "artifact", "payload"];
const TRACE_KEYS: [&str; 7] = [
    "event_id",
    "source",
    "artifact",
    "payload",
    "canon_len",
    "digest",
    "diagnostics",
];

/// One wire-trace event: the observed identity fields plus derived canonical
/// length, digest, and attached diagnostic labels.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub event_id: u64,
    pub source: String,
    pub artifact: String,
    pub payload: Value,
    pub canon_len: usize,
    pub digest: String,
    pub diagnostics: Vec<String>,
}

/// Reads a trace from line-oriented JSON. With `expect_raw`, each line must
/// carry exactly the four raw keys; alternatively the first non-blank line
/// may be a single gateway snapshot envelope, and nothing may follow it.
/// Without `expect_raw`, each line must carry exactly the seven v1 trace
/// keys; claimed `canon_len` / `digest` values are checked against
/// recomputation and mismatches recorded as diagnostics.
///
/// # Errors
/// [`ObserverError::InvalidInput`] for malformed lines or key-set
/// violations, [`ObserverError::Canonicalization`] when a payload cannot be
/// canonically encoded, [`ObserverError::Io`] on read failure.
pub fn read_events<R: BufRead>(reader: R, expect_raw: bool) -> Result<Vec<TraceEvent>, ObserverError> {
    let mut events = Vec::new();
    let mut first_content = true;
    let mut envelope_consumed = false;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if envelope_consumed {
            return Err(ObserverError::InvalidInput(format!(
                "line {line_no}: unexpected content after snapshot envelope"
            )));
        }
        let value: Value = serde_json::from_str(stripped).map_err(|_| {
            ObserverError::InvalidInput(format!("line {line_no}: invalid json"))
        })?;
        if expect_raw && first_content && is_snapshot_envelope(&value) {
            events = from_snapshot_envelope(&value)?;
            envelope_consumed = true;
            first_content = false;
            continue;
        }
        first_content = false;
        events.push(if expect_raw {
            parse_raw_event(&value, line_no)?
        } else {
            parse_trace_event(&value, line_no)?
        });
    }

    Ok(events)
}

/// Writes trace events, one canonical JSON object per line, in the strict
/// seven-key v1 wire shape.
///
/// # Errors
/// [`ObserverError::Io`] on write failure, [`ObserverError::Canonicalization`]
/// if a payload stopped being canonical-safe.
pub fn write_events<W: Write>(events: &[TraceEvent], writer: &mut W) -> Result<(), ObserverError> {
    for event in events {
        let line = json!({
            "event_id": event.event_id,
            "source": event.source,
            "artifact": event.artifact,
            "payload": event.payload,
            "canon_len": event.canon_len,
            "digest": event.digest,
            "diagnostics": event.diagnostics,
        });
        writer.write_all(&canon::canonical_bytes(&line)?)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Projects a gateway snapshot envelope into trace events: each item's
/// `index` becomes `event_id`, the item itself the payload, with derived
/// canonical length and digest.
///
/// # Errors
/// [`ObserverError::InvalidInput`] when items are not objects or lack an
/// integer `index`; [`ObserverError::Canonicalization`] for unsafe payloads.
pub fn from_snapshot_envelope(envelope: &Value) -> Result<Vec<TraceEvent>, ObserverError> {
    let Some(items) = envelope.get("events").and_then(Value::as_array) else {
        return Err(ObserverError::InvalidInput(
            "snapshot envelope events must be an array".to_string(),
        ));
    };
    items
        .iter()
        .map(|item| {
            if !item.is_object() {
                return Err(ObserverError::InvalidInput(
                    "snapshot events must be objects".to_string(),
                ));
            }
            let event_id = item.get("index").and_then(Value::as_u64).ok_or_else(|| {
                ObserverError::InvalidInput(
                    "snapshot event index must be a non-negative integer".to_string(),
                )
            })?;
            derive_trace_event(event_id, GATEWAY_SOURCE, GATEWAY_ARTIFACT, item.clone())
        })
        .collect()
}

/// Shape check only; strict envelope field validation lives at the ingest
/// boundary.
#[must_use]
pub fn is_snapshot_envelope(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    if !object.get("events").is_some_and(Value::is_array) {
        return false;
    }
    ["offset", "limit"].iter().all(|key| match object.get(*key) {
        None | Some(Value::Null) => true,
        Some(other) => other.as_u64().is_some(),
    })
}

fn derive_trace_event(
    event_id: u64,
    source: &str,
    artifact: &str,
    payload: Value,
) -> Result<TraceEvent, ObserverError> {
    let canon_bytes = canon::canonical_bytes(&payload)?;
    Ok(TraceEvent {
        event_id,
        source: source.to_string(),
        artifact: artifact.to_string(),
        canon_len: canon_bytes.len(),
        digest: digest::digest_label(&canon_bytes),
        diagnostics: Vec::new(),
        payload,
    })
}

fn parse_raw_event(value: &Value, line_no: usize) -> Result<TraceEvent, ObserverError> {
    let object = expect_exact_keys(value, &RAW_KEYS, line_no, "raw event")?;
    let event_id = parse_event_id(object, line_no)?;
    let source = parse_str_field(object, "source", line_no)?;
    let artifact = parse_str_field(object, "artifact", line_no)?;
    let payload = object
        .get("payload")
        .cloned()
        .unwrap_or(Value::Null);
    derive_trace_event(event_id, source, artifact, payload)
}

fn parse_trace_event(value: &Value, line_no: usize) -> Result<TraceEvent, ObserverError> {
    let object = expect_exact_keys(value, &TRACE_KEYS, line_no, "trace event")?;
    let event_id = parse_event_id(object, line_no)?;
    let source = parse_str_field(object, "source", line_no)?.to_string();
    let artifact = parse_str_field(object, "artifact", line_no)?.to_string();
    let payload = object.get("payload").cloned().unwrap_or(Value::Null);
    let canon_len = object
        .get("canon_len")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ObserverError::InvalidInput(format!("line {line_no}: canon_len must be int"))
        })? as usize;
    let digest_claim = parse_str_field(object, "digest", line_no)?.to_string();
    let diagnostics = parse_diagnostics(object, line_no)?;

    let canon_bytes = canon::canonical_bytes(&payload)?;
    let mut event = TraceEvent {
        event_id,
        source,
        artifact,
        payload,
        canon_len,
        digest: digest_claim,
        diagnostics,
    };
    if event.canon_len != canon_bytes.len() {
        event
            .diagnostics
            .push(crate::diagnostics::DIAG_CANON_LEN_MISMATCH.to_string());
    }
    if event.digest != digest::digest_label(&canon_bytes) {
        event
            .diagnostics
            .push(crate::diagnostics::DIAG_DIGEST_MISMATCH.to_string());
    }
    Ok(event)
}

fn expect_exact_keys<'a>(
    value: &'a Value,
    expected: &[&str],
    line_no: usize,
    label: &str,
) -> Result<&'a Map<String, Value>, ObserverError> {
    let Some(object) = value.as_object() else {
        return Err(ObserverError::InvalidInput(format!(
            "line {line_no}: expected object"
        )));
    };
    if object.len() != expected.len() || !expected.iter().all(|key| object.contains_key(*key)) {
        return Err(ObserverError::InvalidInput(format!(
            "line {line_no}: expected {label} fields"
        )));
    }
    Ok(object)
}

fn parse_event_id(object: &Map<String, Value>, line_no: usize) -> Result<u64, ObserverError> {
    object.get("event_id").and_then(Value::as_u64).ok_or_else(|| {
        ObserverError::InvalidInput(format!("line {line_no}: event_id must be int"))
    })
}

fn parse_str_field<'a>(
    object: &'a Map<String, Value>,
    field: &str,
    line_no: usize,
) -> Result<&'a str, ObserverError> {
    object.get(field).and_then(Value::as_str).ok_or_else(|| {
        ObserverError::InvalidInput(format!("line {line_no}: {field} must be str"))
    })
}

fn parse_diagnostics(
    object: &Map<String, Value>,
    line_no: usize,
) -> Result<Vec<String>, ObserverError> {
    let Some(items) = object.get("diagnostics").and_then(Value::as_array) else {
        return Err(ObserverError::InvalidInput(format!(
            "line {line_no}: diagnostics must be list"
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ObserverError::InvalidInput(format!(
                    "line {line_no}: diagnostics must be list of str"
                ))
            })
        })
        .collect()
}
