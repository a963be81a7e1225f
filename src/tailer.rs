//! Tails the append-only OTEL-shaped JSONL telemetry log, handles rotation,
//! and dispatches each record into the interpreter.
//!
//! The envelope shape is `{resourceLogs:[{scopeLogs:[{logRecords:[...]}]}]}`,
//! one `logRecords[]` entry per telemetry call site. `body` is itself a JSON
//! document encoded as a string (`body.stringValue`), mirroring how the
//! reference telemetry producer serializes structured payloads.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

use crate::interpreter::{interpret, InterpretOptions, LogRecord};
use crate::model::HISTORY_MAX_AGE_NS;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MISSING_FILE_POLL: Duration = Duration::from_secs(1);

pub fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "resourceLogs", default)]
    resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Deserialize)]
struct ResourceLogs {
    #[serde(rename = "scopeLogs", default)]
    scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Deserialize)]
struct ScopeLogs {
    #[serde(rename = "logRecords", default)]
    log_records: Vec<RawLogRecord>,
}

#[derive(Debug, Deserialize)]
struct RawLogRecord {
    #[serde(rename = "timeUnixNano")]
    time_unix_nano: String,
    #[serde(default)]
    attributes: Vec<RawAttribute>,
    #[serde(default)]
    body: Option<RawAnyValue>,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    key: String,
    value: RawAnyValue,
}

#[derive(Debug, Deserialize, Default)]
struct RawAnyValue {
    #[serde(rename = "stringValue", default)]
    string_value: Option<String>,
    #[serde(rename = "doubleValue", default)]
    double_value: Option<f64>,
    #[serde(rename = "intValue", default)]
    int_value: Option<String>,
    #[serde(rename = "boolValue", default)]
    bool_value: Option<bool>,
}

impl RawAnyValue {
    fn into_json(self) -> Value {
        if let Some(s) = self.string_value {
            Value::String(s)
        } else if let Some(d) = self.double_value {
            serde_json::Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
        } else if let Some(i) = self.int_value {
            i.parse::<i64>().map(Value::from).unwrap_or(Value::Null)
        } else if let Some(b) = self.bool_value {
            Value::Bool(b)
        } else {
            Value::Null
        }
    }
}

/// Parses one JSONL line into its constituent `LogRecord`s. A malformed
/// envelope fails the whole line, but a single record with an unparseable
/// `body` is logged and skipped rather than discarding its siblings: a bad
/// record never stalls the tail.
pub fn parse_line(line: &str) -> Result<Vec<LogRecord>, crate::error::IngestError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    let mut records = Vec::new();
    for resource in envelope.resource_logs {
        for scope in resource.scope_logs {
            for raw in scope.log_records {
                let timestamp: i64 = raw.time_unix_nano.parse().unwrap_or(0);
                let attributes: HashMap<String, Value> = raw
                    .attributes
                    .into_iter()
                    .map(|attr| (attr.key, attr.value.into_json()))
                    .collect();
                let body = match raw.body.and_then(|v| v.string_value) {
                    Some(body_str) => match serde_json::from_str(&body_str) {
                        Ok(body) => body,
                        Err(err) => {
                            debug!(error = %err, "skipping record with malformed body");
                            continue;
                        }
                    },
                    None => Value::Null,
                };
                records.push(LogRecord { timestamp, attributes, body });
            }
        }
    }
    Ok(records)
}

#[cfg(unix)]
fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

/// Replays the entire log file at startup so the model reflects history
/// before the tailer starts watching for new lines. Records older than the
/// history retention window are applied to the model but excluded from the
/// history buffer, per `spec.md` §4.3's cold-start rule.
pub async fn replay_cold_start(state: &AppState, log_path: &Path) -> std::io::Result<()> {
    let Ok(file) = File::open(log_path).await else {
        info!(path = %log_path.display(), "no existing telemetry log, skipping replay");
        return Ok(());
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let cutoff = now_unix_nanos() - HISTORY_MAX_AGE_NS;
    let mut applied = 0u64;

    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_line(trimmed) {
            Ok(records) => {
                let mut model = state.model.write().await;
                for record in &records {
                    let opts = InterpretOptions {
                        store_history: record.timestamp >= cutoff,
                    };
                    interpret(record, &mut model, opts);
                }
                applied += records.len() as u64;
            }
            Err(err) => debug!(error = %err, bytes = trimmed.len(), "skipping malformed line during replay"),
        }
    }

    info!(records = applied, "cold-start replay complete");
    Ok(())
}

/// Tails the log file from its current end, reopening on rotation (file
/// replaced under the same path, detected via inode/length change).
pub async fn run(state: AppState, log_path: std::path::PathBuf) {
    loop {
        let Ok(mut file) = File::open(&log_path).await else {
            tokio::time::sleep(MISSING_FILE_POLL).await;
            continue;
        };
        let Ok(metadata) = file.metadata().await else {
            tokio::time::sleep(MISSING_FILE_POLL).await;
            continue;
        };
        let mut inode = file_inode(&metadata);
        if file.seek(SeekFrom::End(0)).await.is_err() {
            tokio::time::sleep(MISSING_FILE_POLL).await;
            continue;
        }
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        info!(path = %log_path.display(), "tailing telemetry log");

        loop {
            line.clear();
            let read = reader.read_line(&mut line).await;
            match read {
                Ok(0) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    match tokio::fs::metadata(&log_path).await {
                        Ok(meta) if file_inode(&meta) != inode => {
                            info!(path = %log_path.display(), "detected log rotation, reopening");
                            break;
                        }
                        Ok(meta) => inode = file_inode(&meta),
                        Err(_) => {
                            warn!(path = %log_path.display(), "telemetry log missing, waiting");
                            break;
                        }
                    }
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_line(trimmed) {
                        Ok(records) => {
                            for record in &records {
                                dispatch_live(&state, record).await;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, bytes = trimmed.len(), "skipping malformed telemetry line");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "error reading telemetry log, reopening");
                    break;
                }
            }
        }
    }
}

async fn dispatch_live(state: &AppState, record: &LogRecord) {
    let outbound = {
        let mut model = state.model.write().await;
        interpret(record, &mut model, InterpretOptions { store_history: true })
    };
    if let Some(event) = outbound {
        state.fanout.enqueue_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_logs_envelope_into_records() {
        let line = serde_json::json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1000000000",
                        "attributes": [{"key": "event_type", "value": {"stringValue": "connect"}}],
                        "body": {"stringValue": "{\"this_peer\":\"A@1.2.3.4:4000 (@ 0.1)\"}"}
                    }]
                }]
            }]
        })
        .to_string();

        let records = parse_line(&line).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 1_000_000_000);
        assert_eq!(
            records[0].attributes.get("event_type").unwrap().as_str(),
            Some("connect")
        );
        assert_eq!(
            records[0].body.get("this_peer").unwrap().as_str(),
            Some("A@1.2.3.4:4000 (@ 0.1)")
        );
    }

    #[test]
    fn malformed_json_is_rejected_not_panicked() {
        assert!(parse_line("not json at all").is_err());
    }

    #[test]
    fn record_with_invalid_body_is_skipped_not_fatal() {
        let line = serde_json::json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1",
                        "attributes": [],
                        "body": {"stringValue": "not json"}
                    }]
                }]
            }]
        })
        .to_string();
        let records = parse_line(&line).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn bad_record_does_not_discard_its_siblings() {
        let line = serde_json::json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [
                        {
                            "timeUnixNano": "1",
                            "attributes": [],
                            "body": {"stringValue": "not json"}
                        },
                        {
                            "timeUnixNano": "2",
                            "attributes": [{"key": "event_type", "value": {"stringValue": "connect"}}],
                            "body": {"stringValue": "{\"this_peer\":\"A@1.2.3.4:4000 (@ 0.1)\"}"}
                        }
                    ]
                }]
            }]
        })
        .to_string();
        let records = parse_line(&line).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 2);
    }

    #[test]
    fn empty_envelope_yields_no_records() {
        let records = parse_line("{}").unwrap();
        assert!(records.is_empty());
    }
}
