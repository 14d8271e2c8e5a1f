use serde_json::Value;
use thiserror::Error;

use crate::key::ConnectionKey;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("record is not valid JSON: {0}")]
    Json(String),
}

/// One kernel socket-stats sample from the tracing agent. The payload is
/// kept as raw JSON and forwarded untouched; only the addressing fields
/// are interpreted, to route the record. A record without usable
/// addressing fields still parses but can never be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    key: Option<ConnectionKey>,
    raw: Value,
}

impl TraceRecord {
    pub fn parse(line: &[u8]) -> Result<Self, RecordError> {
        let raw: Value =
            serde_json::from_slice(line).map_err(|err| RecordError::Json(err.to_string()))?;
        let key = extract_key(&raw);
        Ok(Self { key, raw })
    }

    pub fn key(&self) -> Option<&ConnectionKey> {
        self.key.as_ref()
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }
}

fn extract_key(raw: &Value) -> Option<ConnectionKey> {
    let local_addr = raw.get("saddr")?.as_str()?.to_string();
    let remote_addr = raw.get("daddr")?.as_str()?.to_string();
    let local_port = port_value(raw.get("sport")?)?;
    let remote_port = port_value(raw.get("dport")?)?;
    Some(ConnectionKey::new(
        local_addr,
        remote_addr,
        local_port,
        remote_port,
    ))
}

// Agents emit ports either as JSON numbers or as decimal strings.
fn port_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub records: Vec<TraceRecord>,
    pub errors: Vec<RecordError>,
}

/// Decodes one read's worth of agent output: newline-delimited JSON, no
/// buffering across reads. A line the agent split across two reads shows
/// up here as malformed fragments. Malformed lines become error entries
/// and do not stop the remaining lines from decoding.
pub fn decode_chunk(chunk: &[u8], max_record_bytes: usize) -> DecodeReport {
    let mut report = DecodeReport::default();
    for line in chunk.split(|byte| *byte == b'\n') {
        let mut line = line;
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }
        if line.len() > max_record_bytes {
            report.errors.push(RecordError::Oversized {
                size: line.len(),
                max: max_record_bytes,
            });
            continue;
        }
        match TraceRecord::parse(line) {
            Ok(record) => report.records.push(record),
            Err(err) => report.errors.push(err),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addressing_fields_into_a_key() {
        let record = TraceRecord::parse(
            br#"{"saddr":"10.0.0.1","daddr":"10.0.0.2","sport":5000,"dport":80,"rtt":42}"#,
        )
        .expect("parse record");
        let key = record.key().expect("key");
        assert_eq!(key.to_string(), "10.0.0.1 10.0.0.2 5000 80");
        assert_eq!(record.raw()["rtt"], 42);
    }

    #[test]
    fn accepts_ports_as_decimal_strings() {
        let record = TraceRecord::parse(
            br#"{"saddr":"10.0.0.1","daddr":"10.0.0.2","sport":"5000","dport":"80"}"#,
        )
        .expect("parse record");
        assert!(record.key().is_some());
    }

    #[test]
    fn record_without_addressing_fields_has_no_key() {
        let record = TraceRecord::parse(br#"{"a":1}"#).expect("parse record");
        assert!(record.key().is_none());
        assert_eq!(record.raw()["a"], 1);
    }

    #[test]
    fn out_of_range_port_leaves_the_record_unroutable() {
        let record = TraceRecord::parse(
            br#"{"saddr":"10.0.0.1","daddr":"10.0.0.2","sport":70000,"dport":80}"#,
        )
        .expect("parse record");
        assert!(record.key().is_none());
    }

    #[test]
    fn chunk_decoding_recovers_after_a_malformed_line() {
        let report = decode_chunk(b"{\"a\":1}\n{bad json\n{\"b\":2}\n", DEFAULT_MAX_RECORD_BYTES);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.records[0].raw()["a"], 1);
        assert_eq!(report.records[1].raw()["b"], 2);
        match &report.errors[0] {
            RecordError::Json(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blank_and_crlf_lines_are_skipped() {
        let report = decode_chunk(b"\r\n{\"a\":1}\r\n   \n\n", DEFAULT_MAX_RECORD_BYTES);
        assert_eq!(report.records.len(), 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn oversized_record_errors_without_stopping_the_chunk() {
        let chunk = format!("{{\"blob\":\"{}\"}}\n{{\"a\":1}}\n", "x".repeat(2_000));
        let report = decode_chunk(chunk.as_bytes(), 1_024);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], RecordError::Oversized { .. }));
    }

    #[test]
    fn trailing_partial_record_is_reported_as_malformed() {
        let report = decode_chunk(b"{\"a\":1}\n{\"b\":", DEFAULT_MAX_RECORD_BYTES);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.errors.len(), 1);
    }
}
