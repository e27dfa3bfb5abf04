//! Lie-detection & nudge engine
//!
//! For every committed candidate turn the engine asks the fact oracle for
//! a bundle of related verified claims, has the runtime classify the
//! utterance against them, and promotes contradictions above the
//! confidence threshold to Lies. Each Lie drives a nudge whose intensity
//! climbs a per-kind ladder and never descends. Elaboration offered on the
//! following candidate turn is captured; a session ending first closes the
//! record with a fixed marker so no lie is lost to timing.

use crate::bus::{BusHandle, ErrorClass, NudgeIntensity, NudgeKind, SessionEvent};
use crate::conversation::PendingNudge;
use crate::knowledge::oracle::FactOracle;
use crate::knowledge::KnowledgeBase;
use crate::runtime::{AgentRuntime, ClaimAnalysis, PromptSpec, Verdict};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Recorded when a candidate never elaborates on a contested claim.
pub const NO_ELABORATION: &str = "(no elaboration provided)";

/// A contradicted claim promoted above the confidence threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lie {
    pub turn_seq: u64,
    pub utterance: String,
    pub confidence: f64,
    pub category: String,
    pub reasoning: String,
    /// Strongest nudge intensity reached for this lie.
    pub intensity: NudgeIntensity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_followup: Option<String>,
}

/// One nudge handed to the conversation loop.
///
/// `turn_seq` is the interviewer turn that actually spoke the nudge, as
/// reported by the bus's `NUDGE_DELIVERED` event; it stays 0 until the
/// delivery is observed. `delivered_at` is stamped from the same event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeRecord {
    pub turn_seq: u64,
    pub kind: NudgeKind,
    pub intensity: NudgeIntensity,
    pub prompt_text: String,
    pub delivered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_followup: Option<String>,
}

/// Per-session engine state. Driven by the controller from bus events.
pub struct LieDetector {
    kb: Arc<KnowledgeBase>,
    runtime: Arc<AgentRuntime>,
    lie_threshold: f64,
    bus: BusHandle,
    nudge_tx: mpsc::Sender<PendingNudge>,

    ladder: HashMap<NudgeKind, NudgeIntensity>,
    lies: Vec<Lie>,
    nudges: Vec<NudgeRecord>,
    /// Lie index awaiting the candidate's next turn as elaboration.
    awaiting_followup: Option<usize>,
    /// Underlying-claim key → lie index, to collapse repeat contradictions.
    contested: HashMap<String, usize>,
}

impl LieDetector {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        runtime: Arc<AgentRuntime>,
        lie_threshold: f64,
        bus: BusHandle,
        nudge_tx: mpsc::Sender<PendingNudge>,
    ) -> Self {
        Self {
            kb,
            runtime,
            lie_threshold,
            bus,
            nudge_tx,
            ladder: HashMap::new(),
            lies: Vec::new(),
            nudges: Vec::new(),
            awaiting_followup: None,
            contested: HashMap::new(),
        }
    }

    pub fn lies(&self) -> &[Lie] {
        &self.lies
    }

    pub fn nudge_records(&self) -> &[NudgeRecord] {
        &self.nudges
    }

    /// Analyze one committed candidate turn.
    pub async fn on_candidate_turn(&mut self, turn_seq: u64, text: &str) -> Result<()> {
        // Whatever the candidate says after a lie nudge is their elaboration.
        if let Some(idx) = self.awaiting_followup.take() {
            self.close_followup(idx, text.to_string());
        }

        let report = FactOracle::new(&self.kb).check(text);
        if report.bundle.is_empty() {
            tracing::debug!(turn_seq, "No related claims; skipping verification");
            return Ok(());
        }

        let analysis = match self
            .runtime
            .ask(PromptSpec::VerifyClaim {
                utterance: text.to_string(),
                fact_bundle: report.bundle_for_prompt(),
            })
            .await
            .and_then(|r| {
                r.into_claim_analysis()
                    .ok_or_else(|| anyhow::anyhow!("unexpected response variant"))
            }) {
            Ok(mut analysis) => {
                analysis.turn_seq = turn_seq;
                analysis
            }
            Err(error) => {
                tracing::warn!(%error, turn_seq, "Claim verification failed");
                self.bus
                    .publish(SessionEvent::SystemWarning {
                        class: ErrorClass::Protocol,
                        message: format!("claim verification failed: {error}"),
                    })
                    .await;
                return Ok(());
            }
        };

        if analysis.verdict == Verdict::Contradicted && analysis.confidence >= self.lie_threshold {
            self.promote(turn_seq, text, &analysis, claim_key(&analysis, &report))
                .await?;
        }
        Ok(())
    }

    /// The editor went quiet: nudge the candidate back to the problem.
    pub async fn on_inactivity(&mut self, elapsed_secs: u64) -> Result<()> {
        let intensity = self.bump(NudgeKind::Inactivity);
        let prompt_text = inactivity_prompt(intensity, elapsed_secs);
        self.dispatch_nudge(NudgeKind::Inactivity, intensity, prompt_text, None)
            .await
    }

    /// Time-based progress check requested by the controller.
    pub async fn on_progress_check(&mut self, elapsed_secs: u64) -> Result<()> {
        let intensity = self.bump(NudgeKind::Progress);
        let prompt_text = format!(
            "Time check: {elapsed_secs} seconds in. Ask the candidate to summarize progress \
             and what remains, and press on pace."
        );
        self.dispatch_nudge(NudgeKind::Progress, intensity, prompt_text, None)
            .await
    }

    /// The conversation loop spoke a nudge: stamp the oldest matching
    /// undelivered record with the delivering turn, mirroring the
    /// `NUDGE_DELIVERED` event so live and replayed outcomes agree.
    pub fn on_nudge_delivered(
        &mut self,
        kind: NudgeKind,
        intensity: NudgeIntensity,
        turn_seq: u64,
        at: DateTime<Utc>,
    ) {
        if let Some(record) = self
            .nudges
            .iter_mut()
            .find(|n| n.kind == kind && n.intensity == intensity && n.turn_seq == 0)
        {
            record.turn_seq = turn_seq;
            record.delivered_at = at;
        } else {
            tracing::debug!(?kind, ?intensity, turn_seq, "Delivery for unknown nudge");
        }
    }

    /// Session is ending: close any pending elaboration with the marker so
    /// the lie still reaches the outcome.
    pub async fn on_session_end(&mut self) {
        if let Some(idx) = self.awaiting_followup.take() {
            self.close_followup(idx, NO_ELABORATION.to_string());
        }
    }

    /// Consume the engine, yielding the lies and nudges for the outcome.
    pub fn into_records(mut self) -> (Vec<Lie>, Vec<NudgeRecord>) {
        if let Some(idx) = self.awaiting_followup.take() {
            self.close_followup(idx, NO_ELABORATION.to_string());
        }
        (self.lies, self.nudges)
    }

    async fn promote(
        &mut self,
        turn_seq: u64,
        utterance: &str,
        analysis: &ClaimAnalysis,
        key: String,
    ) -> Result<()> {
        if let Some(&idx) = self.contested.get(&key) {
            // Repeat contradiction of a contested claim: escalate the
            // existing record instead of emitting a second LIE_DETECTED.
            let intensity = self.bump(NudgeKind::Lie);
            let lie = &mut self.lies[idx];
            lie.intensity = lie.intensity.max(intensity);
            lie.confidence = lie.confidence.max(analysis.confidence);
            let prompt_text = nudge_prompt(intensity, analysis);
            tracing::info!(turn_seq, ?intensity, "Repeat contradiction; escalating nudge");
            self.dispatch_nudge(NudgeKind::Lie, intensity, prompt_text, Some(idx))
                .await?;
            self.awaiting_followup = Some(idx);
            return Ok(());
        }

        let intensity = self.bump(NudgeKind::Lie);
        self.bus
            .publish(SessionEvent::LieDetected {
                turn_seq,
                utterance: utterance.to_string(),
                confidence: analysis.confidence,
                category: analysis.category.clone(),
            })
            .await;

        self.lies.push(Lie {
            turn_seq,
            utterance: utterance.to_string(),
            confidence: analysis.confidence,
            category: analysis.category.clone(),
            reasoning: analysis.reasoning.clone(),
            intensity,
            candidate_followup: None,
        });
        let idx = self.lies.len() - 1;
        self.contested.insert(key, idx);

        let prompt_text = nudge_prompt(intensity, analysis);
        self.dispatch_nudge(NudgeKind::Lie, intensity, prompt_text, Some(idx))
            .await?;
        self.awaiting_followup = Some(idx);
        Ok(())
    }

    async fn dispatch_nudge(
        &mut self,
        kind: NudgeKind,
        intensity: NudgeIntensity,
        prompt_text: String,
        lie_idx: Option<usize>,
    ) -> Result<()> {
        let claim_id = lie_idx.map(|idx| format!("lie-{idx}"));
        self.bus
            .publish(SessionEvent::NudgeRequired {
                nudge: kind,
                intensity,
                prompt_text: prompt_text.clone(),
                claim_id: claim_id.clone(),
            })
            .await;

        // turn_seq 0 = not yet delivered; the NUDGE_DELIVERED event is the
        // authority on which interviewer turn spoke this nudge.
        self.nudges.push(NudgeRecord {
            turn_seq: 0,
            kind,
            intensity,
            prompt_text: prompt_text.clone(),
            delivered_at: Utc::now(),
            candidate_followup: None,
        });

        if self
            .nudge_tx
            .send(PendingNudge {
                kind,
                intensity,
                prompt_text,
                claim_id,
            })
            .await
            .is_err()
        {
            tracing::warn!("Conversation loop gone; nudge recorded but not delivered");
        }
        Ok(())
    }

    /// Next rung of the per-kind ladder. Monotone: never descends.
    fn bump(&mut self, kind: NudgeKind) -> NudgeIntensity {
        let next = match self.ladder.get(&kind) {
            None => NudgeIntensity::Polite,
            Some(current) => current.escalate(),
        };
        self.ladder.insert(kind, next);
        next
    }

    fn close_followup(&mut self, idx: usize, text: String) {
        // The marker only fills a gap; it never overwrites elaboration the
        // candidate actually gave (a repeat contradiction re-arms the lie
        // after its followup was already captured).
        let is_marker = text == NO_ELABORATION;
        if let Some(lie) = self.lies.get_mut(idx) {
            if !(is_marker && lie.candidate_followup.is_some()) {
                lie.candidate_followup = Some(text.clone());
            }
        }
        // The newest nudge for this lie carries the same followup.
        if let Some(nudge) = self
            .nudges
            .iter_mut()
            .rev()
            .find(|n| n.kind == NudgeKind::Lie && n.candidate_followup.is_none())
        {
            nudge.candidate_followup = Some(text);
        }
    }
}

/// Key identifying the underlying contested claim so repeats collapse.
fn claim_key(analysis: &ClaimAnalysis, report: &crate::knowledge::oracle::OracleReport) -> String {
    analysis
        .supporting_claim_ids
        .first()
        .cloned()
        .or_else(|| report.contradictions.first().map(|s| s.claim.id.clone()))
        .unwrap_or_else(|| crate::knowledge::normalize(&analysis.utterance))
}

/// Compose the lie nudge. References the contradicted evidence by category
/// and the model's paraphrased reasoning — never the raw source text.
fn nudge_prompt(intensity: NudgeIntensity, analysis: &ClaimAnalysis) -> String {
    let framing = match intensity {
        NudgeIntensity::Polite => {
            "Gently ask the candidate to double-check that statement"
        }
        NudgeIntensity::Firm => {
            "Directly question the statement and ask for specifics"
        }
        NudgeIntensity::Aggressive => {
            "Confront the inconsistency and demand a clear explanation"
        }
        NudgeIntensity::FinalWarning => {
            "Give a stern final warning that the record does not support this"
        }
    };
    format!(
        "{framing}: their verified {} background appears inconsistent with what they just said. {}",
        analysis.category, analysis.reasoning
    )
}

fn inactivity_prompt(intensity: NudgeIntensity, elapsed_secs: u64) -> String {
    let framing = match intensity {
        NudgeIntensity::Polite => "Check in on how their solution is coming along",
        NudgeIntensity::Firm => "Ask directly what is blocking them",
        NudgeIntensity::Aggressive => "Press them to start writing something concrete now",
        NudgeIntensity::FinalWarning => "Warn that remaining idle will end the exercise",
    };
    format!("The editor has been idle for {elapsed_secs} seconds. {framing}.")
}
