//! Conversation loop
//!
//! Half-duplex, turn-taking voice dialog between the candidate and the AI
//! interviewer. The loop owns the audio path for the whole session:
//! listening accumulates STT segments into an utterance, thinking calls
//! the agent runtime (masking latency with a filler phrase), speaking
//! streams the reply through TTS chunk by chunk so candidate speech can
//! barge in between chunks.

pub mod stt;
pub mod tts;
pub mod turns;

use crate::bus::{BusHandle, ErrorClass, NudgeIntensity, NudgeKind, SessionEvent};
use crate::knowledge::KnowledgeBase;
use crate::runtime::{
    prompts, AgentRuntime, InterviewerTurn, LlmInvalid, PromptSpec, TurnContext, TurnIntent,
};
use crate::session::InterviewMode;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use stt::{SpeechSource, SttSegment};
use tokio::sync::{mpsc, watch, Mutex};
use tts::SpeechSink;
use turns::{Role, TurnLog};

/// STT confidence at or above which speech during playback triggers
/// barge-in.
const BARGE_CONFIDENCE: f64 = 0.6;

/// How many turns of history the interviewer prompt carries.
const HISTORY_CAP: usize = 40;

/// A nudge waiting to be woven into the next interviewer utterance.
#[derive(Debug, Clone)]
pub struct PendingNudge {
    pub kind: NudgeKind,
    pub intensity: NudgeIntensity,
    pub prompt_text: String,
    pub claim_id: Option<String>,
}

/// Everything the loop needs, wired up by the session controller.
pub struct ConversationLoop {
    pub mode: InterviewMode,
    pub candidate_name: String,
    pub end_of_turn_silence: Duration,
    pub filler_latency: Duration,
    pub filler_pool: Vec<String>,
    pub stt: Box<dyn SpeechSource>,
    pub tts: Box<dyn SpeechSink>,
    pub runtime: Arc<AgentRuntime>,
    pub kb: Arc<KnowledgeBase>,
    pub turns: Arc<Mutex<TurnLog>>,
    pub bus: BusHandle,
    pub nudges: mpsc::Receiver<PendingNudge>,
    pub cancel: watch::Receiver<bool>,
    /// Set when TTS has failed and the loop degraded to text-only.
    text_only: bool,
}

enum ListenOutcome {
    Committed {
        text: String,
        confidence: f64,
    },
    Cancelled,
}

enum SpeakOutcome {
    Completed,
    BargedIn(SttSegment),
    Cancelled,
}

impl ConversationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: InterviewMode,
        candidate_name: String,
        end_of_turn_silence: Duration,
        filler_latency: Duration,
        filler_pool: Vec<String>,
        stt: Box<dyn SpeechSource>,
        tts: Box<dyn SpeechSink>,
        runtime: Arc<AgentRuntime>,
        kb: Arc<KnowledgeBase>,
        turns: Arc<Mutex<TurnLog>>,
        bus: BusHandle,
        nudges: mpsc::Receiver<PendingNudge>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            mode,
            candidate_name,
            end_of_turn_silence,
            filler_latency,
            filler_pool,
            stt,
            tts,
            runtime,
            kb,
            turns,
            bus,
            nudges,
            cancel,
            text_only: false,
        }
    }

    /// Drive the dialog until cancelled or the audio path fails hard.
    /// Any unrecovered error is surfaced to the controller as a
    /// `SYSTEM_ERROR` before the task exits.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        if let Err(error) = &result {
            let message = format!("{error:#}");
            // The speech-failure path already reported itself.
            if !message.contains("speech input failed") {
                let class = if message.contains("contract violation") {
                    ErrorClass::Contract
                } else {
                    ErrorClass::Transient
                };
                self.bus
                    .publish(SessionEvent::SystemError {
                        class,
                        message: format!("conversation loop failed: {message}"),
                    })
                    .await;
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut carry_over: Option<SttSegment> = None;

        loop {
            let outcome = self.listen(carry_over.take()).await?;
            let (text, confidence) = match outcome {
                ListenOutcome::Committed { text, confidence } => (text, confidence),
                ListenOutcome::Cancelled => return Ok(()),
            };

            let candidate_seq = {
                let mut turns = self.turns.lock().await;
                turns
                    .append(Role::Candidate, text.clone(), Utc::now(), Some(confidence))?
                    .seq
            };
            self.bus
                .publish(SessionEvent::TurnCandidate {
                    seq: candidate_seq,
                    text: text.clone(),
                    confidence,
                })
                .await;

            let (turn, delivered) = self.think(candidate_seq, &text).await;

            match self.speak(&turn, &delivered).await? {
                SpeakOutcome::Completed => {
                    if turn.intent == TurnIntent::Close {
                        tracing::info!("Interviewer signalled close");
                    }
                }
                SpeakOutcome::BargedIn(segment) => {
                    carry_over = Some(segment);
                }
                SpeakOutcome::Cancelled => return Ok(()),
            }
        }
    }

    /// Accumulate STT segments into one utterance. Commit on the first
    /// final segment followed by enough trailing silence, or on an
    /// explicit end-of-speech marker.
    async fn listen(&mut self, carry_over: Option<SttSegment>) -> Result<ListenOutcome> {
        let mut parts: Vec<String> = Vec::new();
        let mut confidences: Vec<f64> = Vec::new();
        let mut awaiting_silence = false;

        if let Some(seg) = carry_over {
            awaiting_silence = seg.is_final;
            if seg.end_of_speech && !seg.text.is_empty() {
                return Ok(ListenOutcome::Committed {
                    text: seg.text.clone(),
                    confidence: seg.confidence,
                });
            }
            parts.push(seg.text.clone());
            confidences.push(seg.confidence);
        }

        loop {
            if *self.cancel.borrow() {
                return Ok(ListenOutcome::Cancelled);
            }

            let segment = if awaiting_silence {
                match tokio::time::timeout(self.end_of_turn_silence, self.stt.next_segment()).await
                {
                    Err(_) => {
                        // Trailing silence elapsed: the utterance is done.
                        return Ok(commit(parts, confidences));
                    }
                    Ok(seg) => seg,
                }
            } else {
                tokio::select! {
                    _ = self.cancel.changed() => continue,
                    seg = self.stt.next_segment() => seg,
                }
            };

            match segment {
                Ok(Some(seg)) => {
                    if !seg.text.is_empty() {
                        parts.push(seg.text.clone());
                        confidences.push(seg.confidence);
                    }
                    if seg.end_of_speech && !parts.is_empty() {
                        return Ok(commit(parts, confidences));
                    }
                    awaiting_silence = seg.is_final;
                }
                Ok(None) => {
                    if !parts.is_empty() {
                        return Ok(commit(parts, confidences));
                    }
                    return self.speech_path_failed("speech stream ended").await;
                }
                Err(error) => {
                    return self.speech_path_failed(&error.to_string()).await;
                }
            }
        }
    }

    /// The STT reconnect budget is spent: apologize on the record and
    /// surface a hard failure to the controller.
    async fn speech_path_failed(&mut self, detail: &str) -> Result<ListenOutcome> {
        tracing::error!(detail, "Speech input failed beyond recovery");
        {
            let mut turns = self.turns.lock().await;
            turns.append(
                Role::System,
                "I apologize — we are having audio trouble on our end. The interview will be \
                 reviewed from what we have so far.",
                Utc::now(),
                None,
            )?;
        }
        self.bus
            .publish(SessionEvent::SystemError {
                class: ErrorClass::Transient,
                message: format!("speech input failed: {detail}"),
            })
            .await;
        anyhow::bail!("speech input failed: {detail}")
    }

    /// Ask the runtime for the next interviewer action, masking latency
    /// with a deterministic filler phrase.
    async fn think(
        &mut self,
        candidate_seq: u64,
        last_response: &str,
    ) -> (InterviewerTurn, Vec<PendingNudge>) {
        let mut delivered = Vec::new();
        while let Ok(nudge) = self.nudges.try_recv() {
            delivered.push(nudge);
        }
        let pending_text = if delivered.is_empty() {
            "(none)".to_string()
        } else {
            delivered
                .iter()
                .map(|n| format!("- [{:?}/{:?}] {}", n.kind, n.intensity, n.prompt_text))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let context = TurnContext {
            mode: self.mode,
            candidate_name: self.candidate_name.clone(),
            facts: self.kb.facts_for_prompt(),
            history: self.turns.lock().await.capped_history(HISTORY_CAP),
            pending_nudges: pending_text,
            last_response: last_response.to_string(),
        };

        let runtime = Arc::clone(&self.runtime);
        let ask = async move { runtime.ask(PromptSpec::InterviewerTurn(context)).await };
        tokio::pin!(ask);

        let filler_timer = tokio::time::sleep(self.filler_latency);
        tokio::pin!(filler_timer);
        let mut filler_pending = true;

        let result = loop {
            tokio::select! {
                result = &mut ask => break result,
                _ = &mut filler_timer, if filler_pending => {
                    filler_pending = false;
                    let filler =
                        self.filler_pool[candidate_seq as usize % self.filler_pool.len()].clone();
                    tracing::debug!(%filler, "Masking model latency with filler");
                    if let Err(error) = self.play_plain(&filler).await {
                        tracing::warn!(%error, "Filler playback failed");
                    }
                }
            }
        };

        let turn = match result.and_then(|r| {
            r.into_interviewer_turn()
                .ok_or_else(|| anyhow::anyhow!("unexpected response variant"))
        }) {
            Ok(turn) => turn,
            Err(error) => {
                let class = if error.downcast_ref::<LlmInvalid>().is_some() {
                    ErrorClass::Protocol
                } else {
                    ErrorClass::Transient
                };
                self.bus
                    .publish(SessionEvent::SystemWarning {
                        class,
                        message: format!("interviewer turn failed: {error}"),
                    })
                    .await;
                let probe = prompts::FALLBACK_PROBES
                    [candidate_seq as usize % prompts::FALLBACK_PROBES.len()];
                InterviewerTurn {
                    utterance: probe.to_string(),
                    want_followup: true,
                    intent: TurnIntent::Probe,
                }
            }
        };

        (turn, delivered)
    }

    /// Play a short utterance with no barge-in monitoring (fillers).
    async fn play_plain(&mut self, text: &str) -> Result<()> {
        if self.text_only {
            return Ok(());
        }
        let mut handle = self.tts.begin(text).await?;
        while handle.advance().await?.is_some() {}
        Ok(())
    }

    /// Speak the interviewer turn, watching for barge-in between chunks.
    async fn speak(
        &mut self,
        turn: &InterviewerTurn,
        delivered: &[PendingNudge],
    ) -> Result<SpeakOutcome> {
        let text = turn.utterance.as_str();

        if self.text_only {
            let seq = self.record_interviewer_turn(text, None, delivered).await?;
            tracing::info!(seq, "Text-only interviewer turn (TTS degraded)");
            return Ok(SpeakOutcome::Completed);
        }

        let mut handle = match self.tts.begin(text).await {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%error, "TTS failed; degrading to text-only logging");
                self.text_only = true;
                self.bus
                    .publish(SessionEvent::SystemWarning {
                        class: ErrorClass::Transient,
                        message: format!("tts failed, text-only fallback: {error}"),
                    })
                    .await;
                self.record_interviewer_turn(text, None, delivered).await?;
                return Ok(SpeakOutcome::Completed);
            }
        };

        // Select arms only surface values; all &mut self work happens after
        // the borrowed futures are dropped.
        enum Step {
            Advanced(Result<Option<usize>>),
            Heard(Result<Option<SttSegment>>),
        }

        let mut chars_spoken = 0usize;
        loop {
            if *self.cancel.borrow() {
                let _ = handle.abort().await;
                self.record_interviewer_turn(text, Some(chars_spoken), delivered)
                    .await?;
                return Ok(SpeakOutcome::Cancelled);
            }

            let step = tokio::select! {
                advanced = handle.advance() => Step::Advanced(advanced),
                segment = self.stt.next_segment() => Step::Heard(segment),
            };

            match step {
                Step::Advanced(Ok(Some(chars))) => chars_spoken = chars,
                Step::Advanced(Ok(None)) => {
                    self.record_interviewer_turn(text, None, delivered).await?;
                    return Ok(SpeakOutcome::Completed);
                }
                Step::Advanced(Err(error)) => {
                    tracing::warn!(%error, "TTS playback failed; degrading to text-only");
                    self.text_only = true;
                    self.record_interviewer_turn(text, Some(chars_spoken), delivered)
                        .await?;
                    return Ok(SpeakOutcome::Completed);
                }
                Step::Heard(Ok(Some(seg)))
                    if seg.confidence >= BARGE_CONFIDENCE && !seg.text.is_empty() =>
                {
                    tracing::info!(confidence = seg.confidence, "Barge-in: truncating TTS");
                    handle.abort().await.ok();
                    self.record_interviewer_turn(text, Some(chars_spoken), delivered)
                        .await?;
                    return Ok(SpeakOutcome::BargedIn(seg));
                }
                Step::Heard(Ok(_)) => {}
                Step::Heard(Err(error)) => {
                    tracing::warn!(%error, "STT error during playback");
                }
            }
        }
    }

    /// Commit the interviewer turn (full or truncated) and emit events.
    async fn record_interviewer_turn(
        &mut self,
        text: &str,
        truncated_at: Option<usize>,
        delivered: &[PendingNudge],
    ) -> Result<u64> {
        let spoken_text = match truncated_at {
            Some(cut) => {
                let boundary = floor_char_boundary(text, cut);
                &text[..boundary]
            }
            None => text,
        };
        let role = if delivered.is_empty() {
            Role::Interviewer
        } else {
            Role::Nudge
        };

        let seq = {
            let mut turns = self.turns.lock().await;
            turns
                .append(role, spoken_text.to_string(), Utc::now(), None)?
                .seq
        };

        self.bus
            .publish(SessionEvent::TurnInterviewer {
                seq,
                text: spoken_text.to_string(),
                truncated_at,
            })
            .await;

        for nudge in delivered {
            self.bus
                .publish(SessionEvent::NudgeDelivered {
                    turn_seq: seq,
                    nudge: nudge.kind,
                    intensity: nudge.intensity,
                })
                .await;
        }

        Ok(seq)
    }
}

fn commit(parts: Vec<String>, confidences: Vec<f64>) -> ListenOutcome {
    let text = parts.join(" ").trim().to_string();
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    ListenOutcome::Committed { text, confidence }
}

/// Largest byte index `<= at` that sits on a char boundary.
fn floor_char_boundary(text: &str, at: usize) -> usize {
    if at >= text.len() {
        return text.len();
    }
    let mut idx = at;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_averages_confidence() {
        let outcome = commit(
            vec!["I worked".into(), "at Acme".into()],
            vec![0.8, 1.0],
        );
        match outcome {
            ListenOutcome::Committed { text, confidence } => {
                assert_eq!(text, "I worked at Acme");
                assert!((confidence - 0.9).abs() < 1e-9);
            }
            ListenOutcome::Cancelled => panic!("expected commit"),
        }
    }

    #[test]
    fn floor_char_boundary_handles_multibyte() {
        let text = "héllo";
        // Byte 2 is inside the two-byte 'é'.
        assert_eq!(floor_char_boundary(text, 2), 1);
        assert_eq!(floor_char_boundary(text, 100), text.len());
        assert_eq!(floor_char_boundary(text, 0), 0);
    }
}
