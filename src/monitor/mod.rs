//! Code monitor
//!
//! Periodic observer of the remote editor. Every polling interval it
//! captures a snapshot, diffs it against the previous one, and publishes
//! derived events: `CODE_CHANGED` (with a compact diff), `INACTIVITY`
//! (once per stasis window, re-armed by the next change), `SUBMIT_DETECTED`
//! (false→true edge), and `TEST_RESULT` (state transitions).

pub mod editor;
pub mod webdriver;

use crate::bus::{BusHandle, ErrorClass, SessionEvent, TestState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use editor::{EditorProbe, EditorSurface};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Selector misses tolerated before the monitor flags the editor stale.
const STALE_MISS_LIMIT: u32 = 3;

/// Snapshots retained in the ring.
const RING_CAPACITY: usize = 64;

/// Compact diffs are capped at this many bytes.
const DIFF_CAP: usize = 2000;

/// A sampled view of the editor at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnapshot {
    pub t: DateTime<Utc>,
    pub editor_text: String,
    pub language: String,
    pub question_id: String,
    pub test_state: TestState,
    pub submit_in_flight: bool,
}

impl CodeSnapshot {
    /// Two snapshots are equal iff their normalized text and question
    /// match. Timestamps and transient flags don't count.
    pub fn same_content(&self, other: &CodeSnapshot) -> bool {
        self.question_id == other.question_id
            && normalize_code(&self.editor_text) == normalize_code(&other.editor_text)
    }
}

/// Derived view of how long the editor has been static.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InactivityWindow {
    pub since: DateTime<Utc>,
    pub last_equal_at: DateTime<Utc>,
    pub elapsed_secs: u64,
}

/// Summary handed to the consolidator at session end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub samples: usize,
    pub changes: usize,
    pub final_test_state: Option<TestState>,
    pub test_state_history: Vec<TestState>,
    pub final_code: String,
}

/// Normalize code for comparison: uniform newlines, trailing whitespace
/// stripped per line.
fn normalize_code(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compact unified-style diff between two snapshots' text.
fn compact_diff(old: &str, new: &str) -> (String, usize) {
    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    let mut changed = 0usize;
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Equal => continue,
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
        };
        changed += change.value().len();
        if out.len() < DIFF_CAP {
            out.push(sign);
            out.push_str(change.value());
            if !change.value().ends_with('\n') {
                out.push('\n');
            }
        }
    }
    if out.len() > DIFF_CAP {
        out.truncate(DIFF_CAP);
    }
    (out, changed)
}

/// Parse the test result region text into a `TestState`.
///
/// The editor renders either a running indicator or a "Tests Passed: k/n"
/// line once the run completes.
pub fn parse_test_state(region: &str) -> TestState {
    let lowered = region.to_lowercase();
    if lowered.contains("running") {
        return TestState::Running;
    }
    if let Some((passed, total)) = extract_ratio(&lowered) {
        if total > 0 && passed == total {
            return TestState::Passed { passed, total };
        }
        return TestState::Failed { passed, total };
    }
    TestState::Unknown
}

fn extract_ratio(text: &str) -> Option<(u32, u32)> {
    let bytes = text.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        if b == b'/' {
            let left: String = text[..idx]
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            let right: String = text[idx + 1..]
                .chars()
                .skip_while(|c| c.is_whitespace())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let (Ok(p), Ok(t)) = (left.trim().parse(), right.parse()) {
                return Some((p, t));
            }
        }
    }
    None
}

/// The periodic monitoring task for one session.
pub struct CodeMonitor {
    surface: Box<dyn EditorSurface>,
    bus: BusHandle,
    cancel: watch::Receiver<bool>,
    question_id: String,
    editor_url: String,
    polling_interval: Duration,
    inactivity_threshold: Duration,
    poll_timeout: Duration,

    ring: VecDeque<CodeSnapshot>,
    summary: SnapshotSummary,
    latest: Option<CodeSnapshot>,
    last_change_at: Instant,
    last_change_wall: DateTime<Utc>,
    inactivity_armed: bool,
    consecutive_misses: u32,
    reconnected: bool,
    prev_submit_in_flight: bool,
    prev_test_state: TestState,
}

impl CodeMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: Box<dyn EditorSurface>,
        bus: BusHandle,
        cancel: watch::Receiver<bool>,
        question_id: String,
        editor_url: String,
        polling_interval: Duration,
        inactivity_threshold: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            surface,
            bus,
            cancel,
            question_id,
            editor_url,
            polling_interval,
            inactivity_threshold,
            poll_timeout,
            ring: VecDeque::new(),
            summary: SnapshotSummary::default(),
            latest: None,
            last_change_at: Instant::now(),
            last_change_wall: Utc::now(),
            inactivity_armed: true,
            consecutive_misses: 0,
            reconnected: false,
            prev_submit_in_flight: false,
            prev_test_state: TestState::Unknown,
        }
    }

    pub fn current_snapshot(&self) -> Option<&CodeSnapshot> {
        self.latest.as_ref()
    }

    pub fn inactivity_window(&self) -> Option<InactivityWindow> {
        self.latest.as_ref().map(|_| InactivityWindow {
            since: self.last_change_wall,
            last_equal_at: Utc::now(),
            elapsed_secs: self.last_change_at.elapsed().as_secs(),
        })
    }

    pub fn into_summary(self) -> SnapshotSummary {
        self.summary
    }

    /// Navigate once, then poll until cancelled. Returns the end-of-session
    /// snapshot summary.
    pub async fn run(mut self) -> Result<SnapshotSummary> {
        if let Err(error) = self.surface.navigate(&self.editor_url).await {
            tracing::warn!(%error, "Editor navigation failed, retrying once");
            if let Err(error) = self.surface.navigate(&self.editor_url).await {
                self.bus
                    .publish(SessionEvent::SystemError {
                        class: ErrorClass::Transient,
                        message: format!("editor navigation lost: {error}"),
                    })
                    .await;
                anyhow::bail!("editor navigation lost: {error}");
            }
        }
        self.last_change_at = Instant::now();

        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.changed() => {
                    if *self.cancel.borrow() {
                        let _ = self.surface.close().await;
                        return Ok(self.summary);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.poll().await {
                        let _ = self.surface.close().await;
                        return Err(error);
                    }
                }
            }
        }
    }

    /// One polling step.
    async fn poll(&mut self) -> Result<()> {
        let probe = match tokio::time::timeout(self.poll_timeout, self.surface.probe()).await {
            Ok(Ok(probe)) => probe,
            Ok(Err(error)) => {
                return self.handle_probe_failure(&error.to_string()).await;
            }
            Err(_) => {
                return self.handle_selector_miss("poll timed out").await;
            }
        };

        let Some(editor_text) = probe.editor_text.clone() else {
            return self.handle_selector_miss("editor selector missed").await;
        };
        self.consecutive_misses = 0;

        let snapshot = self.build_snapshot(editor_text, &probe);
        self.summary.samples += 1;

        // Change detection drives both the diff event and inactivity arming.
        enum Change {
            Baseline,
            Same,
            Edited { diff: String, chars_changed: usize },
        }
        let change = match &self.latest {
            None => Change::Baseline,
            Some(previous) if previous.same_content(&snapshot) => Change::Same,
            Some(previous) => {
                let (diff, chars_changed) =
                    compact_diff(&previous.editor_text, &snapshot.editor_text);
                Change::Edited { diff, chars_changed }
            }
        };
        match change {
            Change::Baseline => {
                // First observation is the baseline, not a change.
                self.last_change_at = Instant::now();
                self.last_change_wall = Utc::now();
            }
            Change::Same => {
                if self.inactivity_armed
                    && self.last_change_at.elapsed() >= self.inactivity_threshold
                {
                    self.inactivity_armed = false;
                    self.bus
                        .publish(SessionEvent::Inactivity {
                            elapsed_secs: self.last_change_at.elapsed().as_secs(),
                        })
                        .await;
                }
            }
            Change::Edited { diff, chars_changed } => {
                self.note_change().await;
                self.bus
                    .publish(SessionEvent::CodeChanged {
                        question_id: snapshot.question_id.clone(),
                        diff,
                        chars_changed,
                    })
                    .await;
            }
        }

        // Submit edge.
        if snapshot.submit_in_flight && !self.prev_submit_in_flight {
            self.bus
                .publish(SessionEvent::SubmitDetected {
                    question_id: snapshot.question_id.clone(),
                })
                .await;
        }
        self.prev_submit_in_flight = snapshot.submit_in_flight;

        // Test state transitions.
        if snapshot.test_state != self.prev_test_state {
            self.summary.test_state_history.push(snapshot.test_state);
            self.bus
                .publish(SessionEvent::TestResult {
                    question_id: snapshot.question_id.clone(),
                    test: snapshot.test_state,
                })
                .await;
        }
        self.prev_test_state = snapshot.test_state;
        self.summary.final_test_state = Some(snapshot.test_state);
        self.summary.final_code = snapshot.editor_text.clone();

        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(snapshot.clone());
        self.latest = Some(snapshot);
        Ok(())
    }

    fn build_snapshot(&self, editor_text: String, probe: &EditorProbe) -> CodeSnapshot {
        CodeSnapshot {
            t: Utc::now(),
            editor_text,
            language: probe.language.clone().unwrap_or_else(|| "python".to_string()),
            question_id: self.question_id.clone(),
            test_state: probe
                .test_region
                .as_deref()
                .map(parse_test_state)
                .unwrap_or(TestState::Unknown),
            submit_in_flight: probe.submit_in_flight.unwrap_or(false),
        }
    }

    async fn note_change(&mut self) {
        self.last_change_at = Instant::now();
        self.last_change_wall = Utc::now();
        self.inactivity_armed = true;
        self.summary.changes += 1;
    }

    /// Selector miss: treat as unchanged; three in a row flags the editor
    /// stale so the controller can surface a system turn.
    async fn handle_selector_miss(&mut self, detail: &str) -> Result<()> {
        self.consecutive_misses += 1;
        tracing::warn!(detail, misses = self.consecutive_misses, "Editor selector miss");
        if self.consecutive_misses == STALE_MISS_LIMIT {
            self.bus
                .publish(SessionEvent::SystemWarning {
                    class: ErrorClass::Transient,
                    message: format!("EDITOR_STALE: {detail} ({STALE_MISS_LIMIT} consecutive misses)"),
                })
                .await;
        }
        Ok(())
    }

    /// Probe error: one navigation retry for the session, then failed.
    async fn handle_probe_failure(&mut self, detail: &str) -> Result<()> {
        tracing::warn!(detail, "Editor probe failed");
        if !self.reconnected {
            self.reconnected = true;
            match self.surface.navigate(&self.editor_url).await {
                Ok(()) => {
                    tracing::info!("Editor surface reconnected");
                    return Ok(());
                }
                Err(error) => {
                    tracing::error!(%error, "Editor reconnect failed");
                }
            }
        }
        self.bus
            .publish(SessionEvent::SystemError {
                class: ErrorClass::Transient,
                message: format!("editor navigation lost: {detail}"),
            })
            .await;
        anyhow::bail!("editor navigation lost: {detail}")
    }
}
