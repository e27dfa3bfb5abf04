//! Session controller
//!
//! Owns the lifecycle of one interview: builds the knowledge base, spawns
//! the conversation loop, code monitor, bridge and control server, consumes
//! the event bus, arbitrates the end of the session, and hands everything
//! to the consolidator. Exactly one `completing → ended` transition happens
//! and every owned task is cancelled before the outcome is produced.

pub mod control;

use crate::bus::recorder::EventRecorder;
use crate::bus::{
    bridge::SubprocessBridge, Producer, SessionBus, SessionEvent,
};
use crate::config::Config;
use crate::consolidate::{self, ConsolidatorInputs, Outcome, SessionMeta};
use crate::conversation::stt::SpeechSource;
use crate::conversation::turns::TurnLog;
use crate::conversation::tts::SpeechSink;
use crate::conversation::{ConversationLoop, PendingNudge};
use crate::detector::LieDetector;
use crate::knowledge::KnowledgeBase;
use crate::monitor::editor::EditorSurface;
use crate::monitor::{CodeMonitor, SnapshotSummary};
use crate::runtime::provider::CompletionClient;
use crate::runtime::{AgentRuntime, PromptSpec};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// Interview conduct style.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterviewMode {
    Friendly,
    Challenging,
}

impl std::str::FromStr for InterviewMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "friendly" => Ok(InterviewMode::Friendly),
            "challenging" => Ok(InterviewMode::Challenging),
            other => anyhow::bail!("unknown mode: {other} (expected friendly|challenging)"),
        }
    }
}

impl std::fmt::Display for InterviewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterviewMode::Friendly => f.write_str("friendly"),
            InterviewMode::Challenging => f.write_str("challenging"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Collecting,
    Ready,
    Active,
    Completing,
    Ended,
    Failed,
}

/// Candidate identity attached to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub id: String,
    pub display_name: String,
}

/// Internal status snapshot published on every transition.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub last_event: Option<String>,
}

/// What the `status` subcommand sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub session_id: String,
    pub status: SessionStatus,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}

impl StatusReport {
    pub fn view(&self) -> StatusView {
        let now = Utc::now();
        let elapsed = (now - self.started_at).num_seconds().max(0) as u64;
        let remaining = (self.deadline - now).num_seconds().max(0) as u64;
        StatusView {
            session_id: self.session_id.clone(),
            status: self.status,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            last_event: self.last_event.clone(),
        }
    }
}

/// One session per process: the audio devices and the browser session are
/// exclusive resources.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            anyhow::bail!("AlreadyRunning: a session is active in this process");
        }
        Ok(Self)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

/// External transports, injected so tests can script them.
pub struct SessionDeps {
    pub stt: Box<dyn SpeechSource>,
    pub tts: Box<dyn SpeechSink>,
    pub editor: Box<dyn EditorSurface>,
    pub model: Arc<dyn CompletionClient>,
}

impl SessionDeps {
    /// Production wiring from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::conversation::stt::WsSpeechSource;
        use crate::conversation::tts::WsSpeechSink;
        use crate::monitor::editor::WebDriverEditor;
        use crate::runtime::provider::HttpCompletionClient;

        Ok(Self {
            stt: Box::new(WsSpeechSource::new(
                &config.speech.stt_url,
                &config.speech.stt_model,
            )),
            tts: Box::new(WsSpeechSink::new(
                &config.speech.tts_url,
                &config.speech.tts_model,
                config.speech.sample_rate,
            )),
            editor: Box::new(WebDriverEditor::new(
                config.editor.clone(),
                config.external_timeout(),
            )?),
            model: Arc::new(HttpCompletionClient::new(&config.llm)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EndReason {
    Accepted,
    Deadline,
    OperatorStop,
    Failed(String),
}

impl EndReason {
    fn as_str(&self) -> &str {
        match self {
            EndReason::Accepted => "accepted",
            EndReason::Deadline => "deadline",
            EndReason::OperatorStop => "operator_stop",
            EndReason::Failed(_) => "failed",
        }
    }
}

/// Run one interview session to completion and return its outcome.
///
/// Fails with `AlreadyRunning` when a session is active in this process
/// and with `InvalidInput` when the requested deadline is not in the
/// future. A failed session still produces an outcome (status `failed`,
/// non-empty error).
pub async fn run_session(
    config: Config,
    candidate: CandidateProfile,
    mode: InterviewMode,
    duration_secs: Option<u64>,
    question_id: String,
    deps: SessionDeps,
) -> Result<Outcome> {
    let _guard = ActiveGuard::acquire()?;

    let duration_secs = duration_secs.unwrap_or(config.max_duration_secs);
    if duration_secs == 0 {
        anyhow::bail!("InvalidInput: deadline must be in the future");
    }

    let session_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let deadline_wall = started_at + chrono::Duration::seconds(duration_secs as i64);
    let session_dir = config.session_dir(&session_id);
    tokio::fs::create_dir_all(&session_dir).await?;

    let (status_tx, status_rx) = watch::channel(StatusReport {
        session_id: session_id.clone(),
        status: SessionStatus::Initializing,
        started_at,
        deadline: deadline_wall,
        last_event: None,
    });
    let set_status = |status: SessionStatus, last_event: Option<String>| {
        status_tx.send_modify(|report| {
            report.status = status;
            if last_event.is_some() {
                report.last_event = last_event;
            }
        });
    };

    tracing::info!(
        %session_id,
        candidate = %candidate.id,
        %mode,
        duration_secs,
        "Session initializing"
    );

    let meta = SessionMeta {
        session_id: session_id.clone(),
        candidate: candidate.display_name.clone(),
        mode: mode.to_string(),
        started_at,
    };
    tokio::fs::write(
        session_dir.join("session.json"),
        serde_json::to_string_pretty(&meta)?,
    )
    .await?;

    // ── collecting: ingest the knowledge base ──
    set_status(SessionStatus::Collecting, None);
    let kb = KnowledgeBase::build(&config.ingest_dir(&candidate.id))
        .await
        .context("Knowledge base ingestion failed")?;
    let kb = Arc::new(kb);
    tokio::fs::write(
        session_dir.join("knowledge.json"),
        serde_json::to_string_pretty(kb.as_ref())?,
    )
    .await?;

    // ── ready: wire up the plumbing ──
    set_status(SessionStatus::Ready, None);
    let bus = SessionBus::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (nudge_tx, nudge_rx) = mpsc::channel::<PendingNudge>(16);
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(4);
    let (outcome_tx, outcome_rx) = watch::channel::<Option<String>>(None);

    let mut recorder = EventRecorder::open(session_dir.join("events.jsonl")).await?;
    let event_log_path = recorder.path().to_path_buf();

    let runtime = Arc::new(AgentRuntime::new(
        Arc::clone(&deps.model),
        config.llm_timeout(),
        config.llm_schema_retries,
    ));
    let turns = Arc::new(Mutex::new(TurnLog::new()));

    let (_bridge, bridge_task) = SubprocessBridge::start(
        session_dir.join("bridge.sock"),
        session_id.clone(),
        bus.handle(Producer::Bridge),
        cancel_rx.clone(),
    )?;

    // The control server outlives the session cancel broadcast so a
    // second `stop` can still read the cached outcome.
    let (control_cancel_tx, control_cancel_rx) = watch::channel(false);
    let (_control, control_task) = control::ControlServer::start(
        config.data_root.join("run").join("control.sock"),
        status_rx.clone(),
        stop_tx.clone(),
        outcome_rx.clone(),
        control_cancel_rx,
    )?;

    let mut detector = LieDetector::new(
        Arc::clone(&kb),
        Arc::clone(&runtime),
        config.lie_threshold,
        bus.handle(Producer::LieDetector),
        nudge_tx,
    );

    let conversation = ConversationLoop::new(
        mode,
        kb.candidate_first_name().to_string(),
        config.end_of_turn_silence(),
        config.filler_latency_threshold(),
        config.speech.filler_pool.clone(),
        deps.stt,
        deps.tts,
        Arc::clone(&runtime),
        Arc::clone(&kb),
        Arc::clone(&turns),
        bus.handle(Producer::Conversation),
        nudge_rx,
        cancel_rx.clone(),
    );

    let monitor = CodeMonitor::new(
        deps.editor,
        bus.handle(Producer::CodeMonitor),
        cancel_rx.clone(),
        question_id.clone(),
        config.editor_url(&question_id, &session_id),
        config.polling_interval(),
        config.inactivity_threshold(),
        config.poll_timeout(),
    );

    let mut conversation_task = tokio::spawn(conversation.run());
    let mut monitor_task = tokio::spawn(monitor.run());

    // ── active ──
    let controller = bus.handle(Producer::Controller);
    let started_env = controller
        .publish(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
            candidate: candidate.display_name.clone(),
            mode: mode.to_string(),
        })
        .await;
    recorder.record(&started_env).await?;
    set_status(
        SessionStatus::Active,
        Some(started_env.event.kind().to_string()),
    );
    write_status(&session_dir, &status_tx).await;
    tracing::info!(%session_id, "Session active");

    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    let halftime = Instant::now() + Duration::from_secs(duration_secs / 2);
    let mut halftime_done = duration_secs < 120;
    let mut submitted = false;
    let mut end_reason: Option<EndReason> = None;

    // ── event pump: the single bus consumer ──
    while end_reason.is_none() {
        tokio::select! {
            _ = tokio::time::sleep_until(halftime), if !halftime_done => {
                halftime_done = true;
                let elapsed = (Utc::now() - started_at).num_seconds().max(0) as u64;
                if let Err(error) = detector.on_progress_check(elapsed).await {
                    tracing::warn!(%error, "Progress check failed");
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                // Tie-break: a submission already on the bus in this
                // quantum wins over the deadline.
                while let Some(envelope) = bus.try_recv().await {
                    if let Err(error) = recorder.record(&envelope).await {
                        tracing::warn!(%error, "Event log write failed");
                    }
                    if accepts(&envelope.event, &mut submitted) {
                        end_reason = Some(EndReason::Accepted);
                    }
                }
                if end_reason.is_none() {
                    end_reason = Some(EndReason::Deadline);
                }
            }
            _ = stop_rx.recv() => {
                end_reason = Some(EndReason::OperatorStop);
            }
            envelope = bus.recv() => {
                let Some(envelope) = envelope else { break };
                if let Err(error) = recorder.record(&envelope).await {
                    tracing::warn!(%error, "Event log write failed");
                }
                status_tx.send_modify(|report| {
                    report.last_event = Some(envelope.event.kind().to_string());
                });

                match &envelope.event {
                    SessionEvent::TurnCandidate { seq, text, .. } => {
                        let analysis = timeout(
                            config.external_timeout(),
                            detector.on_candidate_turn(*seq, text),
                        )
                        .await;
                        match analysis {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => {
                                tracing::warn!(%error, "Lie detection failed for turn");
                            }
                            Err(_) => tracing::warn!("Lie detection timed out for turn"),
                        }
                    }
                    SessionEvent::Inactivity { elapsed_secs } => {
                        if let Err(error) = detector.on_inactivity(*elapsed_secs).await {
                            tracing::warn!(%error, "Inactivity nudge failed");
                        }
                    }
                    SessionEvent::NudgeDelivered {
                        turn_seq,
                        nudge,
                        intensity,
                    } => {
                        detector.on_nudge_delivered(*nudge, *intensity, *turn_seq, envelope.t);
                    }
                    SessionEvent::SystemError { message, .. } => {
                        end_reason = Some(EndReason::Failed(message.clone()));
                    }
                    SessionEvent::AgentCompleted { reason } => {
                        tracing::info!(?reason, "Subordinate agent completed");
                    }
                    event => {
                        if accepts(event, &mut submitted) {
                            end_reason = Some(EndReason::Accepted);
                        }
                    }
                }
            }
        }
    }

    let end_reason = end_reason.unwrap_or(EndReason::Failed("bus closed".to_string()));

    // ── completing: exactly one transition, bounded shutdown ──
    set_status(SessionStatus::Completing, None);
    write_status(&session_dir, &status_tx).await;
    tracing::info!(%session_id, reason = end_reason.as_str(), "Session completing");
    let _ = cancel_tx.send(true);

    detector.on_session_end().await;

    let grace = config.shutdown_grace();
    let transcript = turns.lock().await.transcript();
    let summary_runtime = Arc::clone(&runtime);
    let summary_fut = async move {
        summary_runtime
            .ask(PromptSpec::FinalSummary { transcript })
            .await
            .ok()
            .and_then(|r| r.into_final_summary())
    };

    let (conversation_res, monitor_res, final_summary) = tokio::join!(
        timeout(grace, &mut conversation_task),
        timeout(grace, &mut monitor_task),
        timeout(grace, summary_fut),
    );
    if conversation_res.is_err() {
        tracing::warn!("Conversation loop exceeded shutdown grace; aborting");
        conversation_task.abort();
    }
    let snapshots: SnapshotSummary = match monitor_res {
        Ok(Ok(Ok(summary))) => summary,
        other => {
            if other.is_err() {
                tracing::warn!("Code monitor exceeded shutdown grace; aborting");
                monitor_task.abort();
            }
            SnapshotSummary::default()
        }
    };

    if let Some(summary) = final_summary.ok().flatten() {
        let _ = tokio::fs::write(
            session_dir.join("summary.json"),
            serde_json::to_string_pretty(&summary).unwrap_or_default(),
        )
        .await;
    }

    // Drain whatever the tasks flushed on their way out, then close the
    // log with the terminal event.
    while let Some(envelope) = bus.try_recv().await {
        let _ = recorder.record(&envelope).await;
    }
    let ended_env = controller
        .publish(SessionEvent::SessionEnded {
            session_id: session_id.clone(),
            reason: end_reason.as_str().to_string(),
        })
        .await;
    recorder.record(&ended_env).await?;
    recorder.flush().await?;

    bridge_task.abort();

    // ── consolidate: always runs, even on failure ──
    let (lies, nudges) = detector.into_records();
    let (status, error) = match &end_reason {
        EndReason::Failed(message) => ("failed".to_string(), Some(message.clone())),
        _ => ("ended".to_string(), None),
    };
    let turns_vec = turns.lock().await.turns().to_vec();
    let outcome = consolidate::consolidate(ConsolidatorInputs {
        session_id: session_id.clone(),
        candidate: candidate.display_name.clone(),
        started_at,
        status,
        error,
        turns: turns_vec,
        lies,
        nudges,
        snapshots,
        kb: kb.as_ref().clone(),
        event_log_path,
    });
    consolidate::write_outcome(&session_dir, &outcome).await?;

    let outcome_body = String::from_utf8(serde_json::to_vec_pretty(&outcome)?)?;
    let _ = outcome_tx.send(Some(outcome_body));

    let final_status = if matches!(end_reason, EndReason::Failed(_)) {
        SessionStatus::Failed
    } else {
        SessionStatus::Ended
    };
    set_status(final_status, Some("SESSION_ENDED".to_string()));
    write_status(&session_dir, &status_tx).await;
    tracing::info!(%session_id, status = ?final_status, "Session ended");

    // Give a racing `stop` a beat to read the outcome, then tear down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = control_cancel_tx.send(true);
    control_task.abort();

    Ok(outcome)
}

/// Acceptance: a detected submission followed by an all-green test result.
fn accepts(event: &SessionEvent, submitted: &mut bool) -> bool {
    match event {
        SessionEvent::SubmitDetected { .. } => {
            *submitted = true;
            false
        }
        SessionEvent::TestResult { test, .. } => *submitted && test.all_passed(),
        _ => false,
    }
}

async fn write_status(session_dir: &Path, status_tx: &watch::Sender<StatusReport>) {
    let view = status_tx.borrow().view();
    if let Ok(body) = serde_json::to_string_pretty(&view) {
        let _ = tokio::fs::write(session_dir.join("status.json"), body).await;
    }
}
