//! Append-only event log
//!
//! One JSON record per line: `{t, producer, seq, kind, payload}`. The
//! recorder is the only writer; the consolidator reads the file back after
//! the session ends. Unknown `kind` values are skipped on read so newer
//! writers never break older readers.

use super::{EventEnvelope, Producer};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// A log record as read back from disk. `payload` holds every field of the
/// original event except the discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub t: DateTime<Utc>,
    pub producer: Producer,
    pub seq: u64,
    pub kind: String,
    pub payload: Value,
}

/// Writes session events to a JSONL file, one line per event.
pub struct EventRecorder {
    path: PathBuf,
    file: File,
}

impl EventRecorder {
    /// Open (or create) the event log at `path` in append mode.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open event log at {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one envelope. The tagged event is split into `kind` plus a
    /// `payload` object so readers can dispatch without knowing every
    /// variant.
    pub async fn record(&mut self, envelope: &EventEnvelope) -> Result<()> {
        let mut fields = serde_json::to_value(&envelope.event)?;
        let kind = envelope.event.kind();
        if let Value::Object(ref mut map) = fields {
            map.remove("kind");
        }

        let record = serde_json::json!({
            "t": envelope.t.to_rfc3339_opts(SecondsFormat::Millis, true),
            "producer": envelope.producer,
            "seq": envelope.seq,
            "kind": kind,
            "payload": fields,
        });

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Flush buffered writes to disk.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Read an event log back. Malformed lines and unknown kinds are skipped
/// with a warning; the reader never fails on forward-compatible content.
pub async fn read_event_log(path: impl AsRef<Path>) -> Result<Vec<RecordedEvent>> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open event log at {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordedEvent>(&line) {
            Ok(event) => {
                if KNOWN_KINDS.contains(&event.kind.as_str()) {
                    events.push(event);
                } else {
                    tracing::debug!(kind = %event.kind, "Skipping unknown event kind");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "Skipping malformed event log line");
            }
        }
    }

    Ok(events)
}

const KNOWN_KINDS: &[&str] = &[
    "SESSION_STARTED",
    "SESSION_ENDED",
    "TURN_CANDIDATE",
    "TURN_INTERVIEWER",
    "NUDGE_REQUIRED",
    "NUDGE_DELIVERED",
    "LIE_DETECTED",
    "CODE_CHANGED",
    "INACTIVITY",
    "SUBMIT_DETECTED",
    "TEST_RESULT",
    "SYSTEM_WARNING",
    "SYSTEM_ERROR",
    "AGENT_OUTPUT",
    "AGENT_ERROR",
    "AGENT_COMPLETED",
];
