//! Log consolidator & scorer
//!
//! Assembles the canonical interview record on session end: turns, lies,
//! nudges, snapshot summary, knowledge digest, and the hirability scores.
//! Always runs — a failed session still produces a best-effort outcome
//! with a non-empty error. The consolidator is the only writer of the
//! outcome document.

pub mod scorer;

use crate::bus::recorder::read_event_log;
use crate::conversation::turns::{ConversationTurn, Role, TurnLog};
use crate::detector::{Lie, NudgeRecord};
use crate::knowledge::{KnowledgeBase, KnowledgeDigest};
use crate::monitor::SnapshotSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub use scorer::{round1, score_candidate, Scores};

/// Pointers from the outcome back to its sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePointers {
    pub knowledge_base_digest: KnowledgeDigest,
    pub event_log_path: String,
}

/// The canonical JSON document produced at session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub session_id: String,
    pub candidate: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub lies: Vec<Lie>,
    pub nudges: Vec<NudgeRecord>,
    pub code_snapshots_summary: SnapshotSummary,
    pub code_score: f64,
    pub communication_score: f64,
    pub scores: Scores,
    pub recommendation: String,
    pub source_pointers: SourcePointers,
}

/// Everything the consolidator needs from a live session.
pub struct ConsolidatorInputs {
    pub session_id: String,
    pub candidate: String,
    pub started_at: DateTime<Utc>,
    pub status: String,
    pub error: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub lies: Vec<Lie>,
    pub nudges: Vec<NudgeRecord>,
    pub snapshots: SnapshotSummary,
    pub kb: KnowledgeBase,
    pub event_log_path: PathBuf,
}

/// Assemble the outcome from collected session data.
pub fn consolidate(inputs: ConsolidatorInputs) -> Outcome {
    let scores = score_candidate(&inputs.kb);
    let recommendation = scorer::recommendation(scores.overall).to_string();
    let code_score = scorer::code_score(&inputs.snapshots);
    let communication_score = scorer::communication_score(&inputs.turns);

    tracing::info!(
        overall = scores.overall,
        %recommendation,
        lies = inputs.lies.len(),
        experience_years = scorer::estimated_experience_years(&inputs.kb),
        "Consolidated interview outcome"
    );

    Outcome {
        session_id: inputs.session_id,
        candidate: inputs.candidate,
        started_at: inputs.started_at,
        ended_at: Utc::now(),
        status: inputs.status,
        error: inputs.error,
        turns: inputs.turns,
        lies: inputs.lies,
        nudges: inputs.nudges,
        code_snapshots_summary: inputs.snapshots,
        code_score,
        communication_score,
        scores,
        recommendation,
        source_pointers: SourcePointers {
            knowledge_base_digest: inputs.kb.digest(),
            event_log_path: inputs.event_log_path.display().to_string(),
        },
    }
}

/// Persist the outcome atomically (temp file + rename) next to the event
/// log.
pub async fn write_outcome(session_dir: &Path, outcome: &Outcome) -> Result<PathBuf> {
    fs::create_dir_all(session_dir).await?;
    let path = session_dir.join("outcome.json");
    let tmp = session_dir.join(".outcome.json.tmp");
    let body = serde_json::to_vec_pretty(outcome)?;
    fs::write(&tmp, &body).await?;
    fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("Failed to write outcome at {}", path.display()))?;
    Ok(path)
}

/// Session metadata the controller writes at start, so the offline
/// `consolidate` subcommand can rebuild an outcome from disk alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub candidate: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
}

/// Rebuild an outcome from a session directory: `session.json`,
/// `knowledge.json`, and the event log.
pub async fn consolidate_from_dir(session_dir: &Path) -> Result<Outcome> {
    let meta: SessionMeta = serde_json::from_str(
        &fs::read_to_string(session_dir.join("session.json"))
            .await
            .context("Missing session.json")?,
    )?;
    let kb: KnowledgeBase = serde_json::from_str(
        &fs::read_to_string(session_dir.join("knowledge.json"))
            .await
            .context("Missing knowledge.json")?,
    )?;

    let event_log_path = session_dir.join("events.jsonl");
    let mut events = read_event_log(&event_log_path).await.unwrap_or_default();
    // Stable merge across producers: session timestamp, then producer
    // priority, then per-producer order.
    events.sort_by(|a, b| {
        a.t.cmp(&b.t)
            .then_with(|| a.producer.priority().cmp(&b.producer.priority()))
            .then_with(|| a.seq.cmp(&b.seq))
    });

    let mut turns = TurnLog::new();
    let mut lies: Vec<Lie> = Vec::new();
    let mut nudges: Vec<NudgeRecord> = Vec::new();
    let mut snapshots = SnapshotSummary::default();
    let mut status = "ended".to_string();
    let mut error = None;

    for event in &events {
        match event.kind.as_str() {
            "TURN_CANDIDATE" => {
                let text = event.payload["text"].as_str().unwrap_or_default();
                let confidence = event.payload["confidence"].as_f64();
                let _ = turns.append(Role::Candidate, text, event.t, confidence);
            }
            "TURN_INTERVIEWER" => {
                let text = event.payload["text"].as_str().unwrap_or_default();
                let _ = turns.append(Role::Interviewer, text, event.t, None);
            }
            "LIE_DETECTED" => {
                lies.push(Lie {
                    turn_seq: event.payload["turn_seq"].as_u64().unwrap_or_default(),
                    utterance: event.payload["utterance"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    confidence: event.payload["confidence"].as_f64().unwrap_or_default(),
                    category: event.payload["category"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    reasoning: String::new(),
                    intensity: crate::bus::NudgeIntensity::Polite,
                    candidate_followup: Some(crate::detector::NO_ELABORATION.to_string()),
                });
            }
            "NUDGE_REQUIRED" => {
                if let Ok(kind) = serde_json::from_value(event.payload["nudge"].clone()) {
                    nudges.push(NudgeRecord {
                        // 0 until a matching NUDGE_DELIVERED stamps the
                        // delivering turn, same as the live engine.
                        turn_seq: 0,
                        kind,
                        intensity: serde_json::from_value(event.payload["intensity"].clone())
                            .unwrap_or(crate::bus::NudgeIntensity::Polite),
                        prompt_text: event.payload["prompt_text"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        delivered_at: event.t,
                        candidate_followup: None,
                    });
                }
            }
            "NUDGE_DELIVERED" => {
                let kind: Result<crate::bus::NudgeKind, _> =
                    serde_json::from_value(event.payload["nudge"].clone());
                let intensity: Result<crate::bus::NudgeIntensity, _> =
                    serde_json::from_value(event.payload["intensity"].clone());
                if let (Ok(kind), Ok(intensity)) = (kind, intensity) {
                    if let Some(record) = nudges
                        .iter_mut()
                        .find(|n| n.kind == kind && n.intensity == intensity && n.turn_seq == 0)
                    {
                        record.turn_seq = event.payload["turn_seq"].as_u64().unwrap_or_default();
                        record.delivered_at = event.t;
                    }
                }
            }
            "CODE_CHANGED" => snapshots.changes += 1,
            "TEST_RESULT" => {
                if let Ok(state) = serde_json::from_value(event.payload.clone()) {
                    snapshots.test_state_history.push(state);
                    snapshots.final_test_state = Some(state);
                }
            }
            "SYSTEM_ERROR" => {
                status = "failed".to_string();
                error = Some(
                    event.payload["message"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string(),
                );
            }
            _ => {}
        }
    }
    snapshots.samples = snapshots.changes;

    Ok(consolidate(ConsolidatorInputs {
        session_id: meta.session_id,
        candidate: meta.candidate,
        started_at: meta.started_at,
        status,
        error,
        turns: turns.turns().to_vec(),
        lies,
        nudges,
        snapshots,
        kb,
        event_log_path,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{normalize, Claim, ClaimCategory, ClaimSource};

    fn kb() -> KnowledgeBase {
        let mk = |category, text: &str| Claim {
            id: uuid::Uuid::new_v4().to_string(),
            source: ClaimSource::Resume,
            category,
            text: text.to_string(),
            normalized_text: normalize(text),
            confidence: 0.95,
            artifact_stamp: "20260101".to_string(),
        };
        KnowledgeBase::from_claims(vec![
            mk(ClaimCategory::Experience, "Senior Software Engineer, 6 years experience"),
            mk(ClaimCategory::Skill, "Python, Rust, Kubernetes, PostgreSQL"),
            mk(ClaimCategory::Skill, "PyTorch and machine learning pipelines"),
            mk(ClaimCategory::Education, "Master of Computer Science degree"),
            mk(ClaimCategory::Achievement, "Led a team with strong communication"),
        ])
    }

    fn inputs() -> ConsolidatorInputs {
        ConsolidatorInputs {
            session_id: "sess-1".into(),
            candidate: "Priya Sharma".into(),
            started_at: Utc::now(),
            status: "ended".into(),
            error: None,
            turns: Vec::new(),
            lies: Vec::new(),
            nudges: Vec::new(),
            snapshots: SnapshotSummary::default(),
            kb: kb(),
            event_log_path: PathBuf::from("/tmp/events.jsonl"),
        }
    }

    #[test]
    fn outcome_has_fixed_top_level_keys() {
        let outcome = consolidate(inputs());
        let value = serde_json::to_value(&outcome).unwrap();
        for key in [
            "session_id",
            "candidate",
            "started_at",
            "ended_at",
            "turns",
            "lies",
            "nudges",
            "code_snapshots_summary",
            "scores",
            "recommendation",
            "source_pointers",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        let scores = &value["scores"];
        for key in ["technical", "ai_ml", "experience", "education", "soft", "overall"] {
            assert!(scores.get(key).is_some(), "missing score {key}");
        }
        assert!(value["source_pointers"].get("knowledge_base_digest").is_some());
        assert!(value["source_pointers"].get("event_log_path").is_some());
    }

    #[test]
    fn failed_session_keeps_error_field() {
        let mut i = inputs();
        i.status = "failed".into();
        i.error = Some("stt gave up".into());
        let outcome = consolidate(i);
        assert_eq!(outcome.status, "failed");
        assert_eq!(outcome.error.as_deref(), Some("stt gave up"));
    }

    #[tokio::test]
    async fn write_outcome_is_stable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = consolidate(inputs());
        let path = write_outcome(dir.path(), &outcome).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();
        write_outcome(dir.path(), &outcome).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn consolidate_from_dir_rebuilds_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let meta = SessionMeta {
            session_id: "sess-9".into(),
            candidate: "A B".into(),
            mode: "challenging".into(),
            started_at: Utc::now(),
        };
        tokio::fs::write(
            dir.path().join("session.json"),
            serde_json::to_string(&meta).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("knowledge.json"),
            serde_json::to_string(&kb()).unwrap(),
        )
        .await
        .unwrap();
        let log = concat!(
            r#"{"t":"2026-01-01T00:00:00.000Z","producer":"conversation","seq":1,"kind":"TURN_INTERVIEWER","payload":{"seq":1,"text":"hello"}}"#,
            "\n",
            r#"{"t":"2026-01-01T00:00:01.000Z","producer":"conversation","seq":2,"kind":"TURN_CANDIDATE","payload":{"seq":2,"text":"hi","confidence":0.9}}"#,
            "\n",
            r#"{"t":"2026-01-01T00:00:02.000Z","producer":"lie_detector","seq":1,"kind":"LIE_DETECTED","payload":{"turn_seq":2,"utterance":"x","confidence":0.8,"category":"experience"}}"#,
            "\n",
            r#"{"t":"2026-01-01T00:00:02.500Z","producer":"lie_detector","seq":2,"kind":"NUDGE_REQUIRED","payload":{"nudge":"lie","intensity":"polite","prompt_text":"press for specifics"}}"#,
            "\n",
            r#"{"t":"2026-01-01T00:00:03.000Z","producer":"conversation","seq":3,"kind":"NUDGE_DELIVERED","payload":{"turn_seq":3,"nudge":"lie","intensity":"polite"}}"#,
            "\n",
        );
        tokio::fs::write(dir.path().join("events.jsonl"), log)
            .await
            .unwrap();

        let outcome = consolidate_from_dir(dir.path()).await.unwrap();
        assert_eq!(outcome.session_id, "sess-9");
        assert_eq!(outcome.turns.len(), 2);
        assert_eq!(outcome.lies.len(), 1);
        assert_eq!(outcome.lies[0].turn_seq, 2);
        // The delivered event is the authority on the nudge's turn.
        assert_eq!(outcome.nudges.len(), 1);
        assert_eq!(outcome.nudges[0].turn_seq, 3);
        assert_eq!(outcome.nudges[0].prompt_text, "press for specifics");
    }
}
