//! Session control socket
//!
//! A small NDJSON command endpoint (`control.sock` under the data root)
//! serving the CLI `status` and `stop` subcommands. `stop` waits for the
//! consolidated outcome and replies with the exact bytes every time, so
//! repeated stops are idempotent.

use super::StatusReport;
use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long a `stop` request waits for the outcome document.
const STOP_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ControlServer {
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket and serve until cancelled.
    pub fn start(
        path: impl Into<PathBuf>,
        status_rx: watch::Receiver<StatusReport>,
        stop_tx: mpsc::Sender<()>,
        outcome_rx: watch::Receiver<Option<String>>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;

        let server = Self { path: path.clone() };
        let task = tokio::spawn(serve(listener, status_rx, stop_tx, outcome_rx, cancel));
        Ok((server, task))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(
    listener: UnixListener,
    status_rx: watch::Receiver<StatusReport>,
    stop_tx: mpsc::Sender<()>,
    outcome_rx: watch::Receiver<Option<String>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let status_rx = status_rx.clone();
                        let stop_tx = stop_tx.clone();
                        let outcome_rx = outcome_rx.clone();
                        tokio::spawn(async move {
                            if let Err(error) =
                                handle(stream, status_rx, stop_tx, outcome_rx).await
                            {
                                tracing::debug!(%error, "Control connection failed");
                            }
                        });
                    }
                    Err(error) => tracing::warn!(%error, "Control accept failed"),
                }
            }
        }
    }
}

async fn handle(
    stream: UnixStream,
    status_rx: watch::Receiver<StatusReport>,
    stop_tx: mpsc::Sender<()>,
    mut outcome_rx: watch::Receiver<Option<String>>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let request: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(error) => {
                let reply = json!({"error": format!("invalid request: {error}")});
                write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await?;
                continue;
            }
        };

        match request.get("cmd").and_then(|c| c.as_str()) {
            Some("status") => {
                let report = status_rx.borrow().clone();
                let reply = serde_json::to_string(&report.view())?;
                write_half.write_all(format!("{reply}\n").as_bytes()).await?;
            }
            Some("stop") => {
                // Idempotent: if the outcome already exists, skip signalling.
                if outcome_rx.borrow().is_none() {
                    let _ = stop_tx.send(()).await;
                }
                let outcome =
                    tokio::time::timeout(STOP_REPLY_TIMEOUT, wait_outcome(&mut outcome_rx)).await;
                match outcome {
                    Ok(Some(body)) => {
                        write_half.write_all(body.as_bytes()).await?;
                        write_half.write_all(b"\n").await?;
                    }
                    _ => {
                        let reply = json!({"error": "outcome not available"});
                        write_half
                            .write_all(format!("{reply}\n").as_bytes())
                            .await?;
                    }
                }
            }
            other => {
                let reply = json!({"error": format!("unknown cmd: {other:?}")});
                write_half.write_all(format!("{reply}\n").as_bytes()).await?;
            }
        }
    }
    Ok(())
}

async fn wait_outcome(outcome_rx: &mut watch::Receiver<Option<String>>) -> Option<String> {
    loop {
        if let Some(body) = outcome_rx.borrow().clone() {
            return Some(body);
        }
        if outcome_rx.changed().await.is_err() {
            return outcome_rx.borrow().clone();
        }
    }
}

/// Client side used by the CLI: send one command, read one reply line.
pub async fn request(path: &Path, cmd: &str) -> Result<String> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("No session listening at {}", path.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(format!("{}\n", json!({ "cmd": cmd })).as_bytes())
        .await?;

    let mut lines = BufReader::new(read_half).lines();
    lines
        .next_line()
        .await?
        .context("Control connection closed without a reply")
}
