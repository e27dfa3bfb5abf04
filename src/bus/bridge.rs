//! Subprocess bridge
//!
//! A named local IPC endpoint (Unix domain socket in the session
//! directory) through which a subordinate process posts structured events
//! as newline-delimited JSON. Each record is validated against the inbound
//! schema; malformed records are logged, counted, and dropped with a single
//! `SYSTEM_WARNING` — they never crash the session or change its state.

use super::{BusHandle, CompletionReason, ErrorClass, SessionEvent};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Inbound record shape: `{type, session_id, data}`.
#[derive(Debug, Deserialize)]
struct BridgeRecord {
    #[serde(rename = "type")]
    record_type: String,
    session_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Listens on a Unix socket and forwards validated records to the bus.
pub struct SubprocessBridge {
    path: PathBuf,
    dropped: Arc<AtomicU64>,
}

impl SubprocessBridge {
    /// Bind the bridge socket and start accepting writers. The returned
    /// task runs until `cancel` flips true.
    pub fn start(
        path: impl Into<PathBuf>,
        session_id: String,
        handle: BusHandle,
        cancel: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        // A stale socket from a crashed run blocks bind.
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind bridge socket {}", path.display()))?;

        let dropped = Arc::new(AtomicU64::new(0));
        let bridge = Self {
            path: path.clone(),
            dropped: Arc::clone(&dropped),
        };

        let task = tokio::spawn(accept_loop(listener, session_id, handle, cancel, dropped));
        Ok((bridge, task))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of malformed or misaddressed records dropped so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SubprocessBridge {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    session_id: String,
    handle: BusHandle,
    mut cancel: watch::Receiver<bool>,
    dropped: Arc<AtomicU64>,
) {
    let handle = Arc::new(handle);
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    tracing::debug!("Bridge accept loop cancelled");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let session_id = session_id.clone();
                        let handle = Arc::clone(&handle);
                        let cancel = cancel.clone();
                        let dropped = Arc::clone(&dropped);
                        tokio::spawn(async move {
                            read_records(stream, session_id, handle, cancel, dropped).await;
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Bridge accept failed");
                    }
                }
            }
        }
    }
}

async fn read_records(
    stream: tokio::net::UnixStream,
    session_id: String,
    handle: Arc<BusHandle>,
    mut cancel: watch::Receiver<bool>,
    dropped: Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        match parse_record(&raw, &session_id) {
                            Ok(event) => {
                                handle.publish(event).await;
                            }
                            Err(reason) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%reason, "Dropping malformed bridge record");
                                handle
                                    .publish(SessionEvent::SystemWarning {
                                        class: ErrorClass::Protocol,
                                        message: format!("bridge record dropped: {reason}"),
                                    })
                                    .await;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(error) => {
                        tracing::debug!(%error, "Bridge connection read error");
                        return;
                    }
                }
            }
        }
    }
}

/// Validate one NDJSON line against the inbound schema and translate it to
/// a bus event.
fn parse_record(raw: &str, session_id: &str) -> std::result::Result<SessionEvent, String> {
    let record: BridgeRecord =
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;

    if record.session_id != session_id {
        return Err(format!(
            "session_id mismatch: got {}, expected {session_id}",
            record.session_id
        ));
    }

    match record.record_type.as_str() {
        "AGENT_OUTPUT" => Ok(SessionEvent::AgentOutput {
            message: stringify_data(&record.data),
        }),
        "AGENT_ERROR" => Ok(SessionEvent::AgentError {
            message: stringify_data(&record.data),
        }),
        "AGENT_COMPLETED" => {
            let reason = record
                .data
                .get("reason")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "AGENT_COMPLETED missing data.reason".to_string())?;
            let reason = match reason {
                "completed" => CompletionReason::Completed,
                "error" => CompletionReason::Error,
                "interrupted" => CompletionReason::Interrupted,
                "timeout" => CompletionReason::Timeout,
                other => return Err(format!("unknown completion reason: {other}")),
            };
            Ok(SessionEvent::AgentCompleted { reason })
        }
        other => Err(format!("unknown record type: {other}")),
    }
}

fn stringify_data(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
