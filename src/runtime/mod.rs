//! Agent runtime
//!
//! Uniform interface to the LLM. `ask` takes a prompt spec naming a
//! template, a context bundle and the schema the reply must conform to;
//! the reply is validated and exposed as a tagged variant. Schema
//! mismatches are retried with a stricter reminder, then surfaced as
//! `LlmInvalid`. Calls are serialized per session and cancellable: the
//! future is drop-safe and dropping it discards the partial result.

pub mod prompts;
pub mod provider;

use crate::session::InterviewMode;
use anyhow::Result;
use provider::{ChatRequest, CompletionClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Context bundle for an interviewer turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub mode: InterviewMode,
    pub candidate_name: String,
    pub facts: String,
    pub history: String,
    pub pending_nudges: String,
    pub last_response: String,
}

/// Names a template plus the context it needs.
#[derive(Debug, Clone)]
pub enum PromptSpec {
    InterviewerTurn(TurnContext),
    VerifyClaim {
        utterance: String,
        fact_bundle: String,
    },
    FinalSummary {
        transcript: String,
    },
    Hirability {
        facts: String,
        job_description: String,
    },
}

impl PromptSpec {
    fn template_name(&self) -> &'static str {
        match self {
            PromptSpec::InterviewerTurn(_) => "interviewer-turn",
            PromptSpec::VerifyClaim { .. } => "verify-claim",
            PromptSpec::FinalSummary { .. } => "final-summary",
            PromptSpec::Hirability { .. } => "hirability",
        }
    }

    fn to_request(&self) -> ChatRequest {
        match self {
            PromptSpec::InterviewerTurn(ctx) => ChatRequest {
                system: prompts::interviewer_system(ctx.mode).to_string(),
                user: prompts::interviewer_user(
                    &ctx.candidate_name,
                    &ctx.facts,
                    &ctx.history,
                    &ctx.pending_nudges,
                    &ctx.last_response,
                ),
            },
            PromptSpec::VerifyClaim {
                utterance,
                fact_bundle,
            } => ChatRequest {
                system: prompts::VERIFY_CLAIM_SYSTEM.to_string(),
                user: prompts::verify_claim_user(utterance, fact_bundle),
            },
            PromptSpec::FinalSummary { transcript } => ChatRequest {
                system: prompts::FINAL_SUMMARY_SYSTEM.to_string(),
                user: prompts::final_summary_user(transcript),
            },
            PromptSpec::Hirability {
                facts,
                job_description,
            } => ChatRequest {
                system: prompts::HIRABILITY_SYSTEM.to_string(),
                user: prompts::hirability_user(facts, job_description),
            },
        }
    }
}

// ─── Structured responses ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnIntent {
    Question,
    Probe,
    NudgeAck,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewerTurn {
    pub utterance: String,
    pub want_followup: bool,
    pub intent: TurnIntent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Consistent,
    Unverifiable,
    Contradicted,
}

/// Output of the verification prompt for one candidate turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimAnalysis {
    #[serde(default)]
    pub turn_seq: u64,
    #[serde(default)]
    pub utterance: String,
    pub verdict: Verdict,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_claim_ids: Vec<String>,
    pub category: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub overall_summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub areas_for_improvement: Vec<String>,
    #[serde(default)]
    pub hiring_recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HirabilityAssessment {
    pub recommendation: String,
    pub rationale: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A schema-validated model reply.
#[derive(Debug, Clone)]
pub enum StructuredResponse {
    InterviewerTurn(InterviewerTurn),
    ClaimAnalysis(ClaimAnalysis),
    FinalSummary(FinalSummary),
    HirabilityAssessment(HirabilityAssessment),
}

impl StructuredResponse {
    pub fn into_interviewer_turn(self) -> Option<InterviewerTurn> {
        match self {
            StructuredResponse::InterviewerTurn(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_claim_analysis(self) -> Option<ClaimAnalysis> {
        match self {
            StructuredResponse::ClaimAnalysis(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_final_summary(self) -> Option<FinalSummary> {
        match self {
            StructuredResponse::FinalSummary(s) => Some(s),
            _ => None,
        }
    }
}

/// The model kept failing schema validation after every retry.
#[derive(Debug)]
pub struct LlmInvalid {
    pub template: &'static str,
    pub attempts: u32,
    pub detail: String,
}

impl std::fmt::Display for LlmInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LLM_INVALID: {} failed schema validation after {} attempts: {}",
            self.template, self.attempts, self.detail
        )
    }
}

impl std::error::Error for LlmInvalid {}

// ─── AgentRuntime ────────────────────────────────────────────────────────

/// Serialized, validated gateway to the model for one session.
pub struct AgentRuntime {
    client: Arc<dyn CompletionClient>,
    call_lock: Mutex<()>,
    timeout: Duration,
    schema_retries: u32,
}

impl AgentRuntime {
    pub fn new(client: Arc<dyn CompletionClient>, timeout: Duration, schema_retries: u32) -> Self {
        Self {
            client,
            call_lock: Mutex::new(()),
            timeout,
            schema_retries,
        }
    }

    /// Dispatch one prompt and return the validated structured response.
    ///
    /// At most one call is in flight per session; concurrent callers queue
    /// on the internal lock. Dropping the returned future cancels the call.
    pub async fn ask(&self, spec: PromptSpec) -> Result<StructuredResponse> {
        let _guard = self.call_lock.lock().await;

        let template = spec.template_name();
        let base = spec.to_request();
        let attempts = self.schema_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let mut request = base.clone();
            if attempt > 0 {
                request.user.push_str(prompts::STRICT_SCHEMA_REMINDER);
            }

            let raw = match tokio::time::timeout(self.timeout, self.client.complete(request)).await
            {
                Ok(Ok(text)) => text,
                Ok(Err(error)) => {
                    tracing::warn!(template, attempt, %error, "LLM call failed");
                    last_error = error.to_string();
                    continue;
                }
                Err(_) => {
                    tracing::warn!(template, attempt, "LLM call timed out");
                    last_error = format!("timed out after {:?}", self.timeout);
                    continue;
                }
            };

            match parse_response(&spec, &raw) {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::warn!(template, attempt, %error, "Schema validation failed");
                    last_error = error.to_string();
                }
            }
        }

        Err(anyhow::Error::new(LlmInvalid {
            template,
            attempts,
            detail: last_error,
        }))
    }
}

/// Strip markdown fences and any prose around the outermost JSON object.
/// Models wrap JSON in ```json fences often enough that this is load-bearing.
fn sanitize_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

fn parse_response(spec: &PromptSpec, raw: &str) -> Result<StructuredResponse> {
    let json = sanitize_json(raw);
    match spec {
        PromptSpec::InterviewerTurn(_) => {
            let turn: InterviewerTurn = serde_json::from_str(json)?;
            if turn.utterance.trim().is_empty() {
                anyhow::bail!("utterance is empty");
            }
            Ok(StructuredResponse::InterviewerTurn(turn))
        }
        PromptSpec::VerifyClaim { utterance, .. } => {
            let mut analysis: ClaimAnalysis = serde_json::from_str(json)?;
            if !(0.0..=1.0).contains(&analysis.confidence) {
                anyhow::bail!("confidence {} outside [0,1]", analysis.confidence);
            }
            if analysis.utterance.is_empty() {
                analysis.utterance = utterance.clone();
            }
            Ok(StructuredResponse::ClaimAnalysis(analysis))
        }
        PromptSpec::FinalSummary { .. } => {
            let summary: FinalSummary = serde_json::from_str(json)?;
            if summary.overall_summary.trim().is_empty() {
                anyhow::bail!("overall_summary is empty");
            }
            Ok(StructuredResponse::FinalSummary(summary))
        }
        PromptSpec::Hirability { .. } => {
            let assessment: HirabilityAssessment = serde_json::from_str(json)?;
            Ok(StructuredResponse::HirabilityAssessment(assessment))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted client: returns canned replies in order, then repeats the
    /// last one.
    struct ScriptedModel {
        replies: Vec<String>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedModel {
        async fn complete(&self, _request: ChatRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = n.min(self.replies.len().saturating_sub(1));
            Ok(self.replies[idx].clone())
        }
    }

    fn verify_spec() -> PromptSpec {
        PromptSpec::VerifyClaim {
            utterance: "I was a Senior Engineer at Google for five years".into(),
            fact_bundle: "- [experience] Microsoft Jr Dev, 2 yrs".into(),
        }
    }

    #[tokio::test]
    async fn valid_response_parses_first_try() {
        let model = ScriptedModel::new(&[
            r#"{"verdict":"contradicted","confidence":0.92,"supporting_claim_ids":[],"category":"experience","reasoning":"resume says Microsoft"}"#,
        ]);
        let runtime = AgentRuntime::new(model.clone(), Duration::from_secs(5), 2);

        let analysis = runtime
            .ask(verify_spec())
            .await
            .unwrap()
            .into_claim_analysis()
            .unwrap();
        assert_eq!(analysis.verdict, Verdict::Contradicted);
        assert_eq!(analysis.confidence, 0.92);
        // The runtime backfills the analyzed utterance.
        assert!(analysis.utterance.contains("Senior Engineer"));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn fenced_json_is_sanitized() {
        let model = ScriptedModel::new(&[
            "Here you go:\n```json\n{\"utterance\":\"Tell me more.\",\"want_followup\":true,\"intent\":\"probe\"}\n```",
        ]);
        let runtime = AgentRuntime::new(model, Duration::from_secs(5), 0);

        let turn = runtime
            .ask(PromptSpec::InterviewerTurn(TurnContext {
                mode: InterviewMode::Challenging,
                candidate_name: "A".into(),
                facts: String::new(),
                history: String::new(),
                pending_nudges: "(none)".into(),
                last_response: "hi".into(),
            }))
            .await
            .unwrap()
            .into_interviewer_turn()
            .unwrap();
        assert_eq!(turn.intent, TurnIntent::Probe);
    }

    #[tokio::test]
    async fn schema_drift_retries_then_fails_llm_invalid() {
        let model = ScriptedModel::new(&[r#"{"oops": true}"#]);
        let runtime = AgentRuntime::new(model.clone(), Duration::from_secs(5), 2);

        let error = runtime.ask(verify_spec()).await.unwrap_err();
        let invalid = error
            .downcast_ref::<LlmInvalid>()
            .expect("should be LlmInvalid");
        assert_eq!(invalid.attempts, 3);
        assert_eq!(invalid.template, "verify-claim");
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn recovery_on_second_attempt() {
        let model = ScriptedModel::new(&[
            "not json at all",
            r#"{"verdict":"consistent","confidence":0.8,"category":"experience","reasoning":"matches"}"#,
        ]);
        let runtime = AgentRuntime::new(model.clone(), Duration::from_secs(5), 2);

        let analysis = runtime
            .ask(verify_spec())
            .await
            .unwrap()
            .into_claim_analysis()
            .unwrap();
        assert_eq!(analysis.verdict, Verdict::Consistent);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_schema_error() {
        let model = ScriptedModel::new(&[
            r#"{"verdict":"contradicted","confidence":1.4,"category":"experience","reasoning":"x"}"#,
        ]);
        let runtime = AgentRuntime::new(model, Duration::from_secs(5), 0);
        assert!(runtime.ask(verify_spec()).await.is_err());
    }

    #[tokio::test]
    async fn hirability_template_parses_assessment() {
        let model = ScriptedModel::new(&[
            r#"{"recommendation":"Hire","rationale":"background lines up with the role","confidence":0.7}"#,
        ]);
        let runtime = AgentRuntime::new(model, Duration::from_secs(5), 0);

        let response = runtime
            .ask(PromptSpec::Hirability {
                facts: "- [skill] Rust".into(),
                job_description: "- systems engineer".into(),
            })
            .await
            .unwrap();
        match response {
            StructuredResponse::HirabilityAssessment(assessment) => {
                assert_eq!(assessment.recommendation, "Hire");
                assert!(assessment.confidence > 0.0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_summary_template_parses() {
        let model = ScriptedModel::new(&[
            r#"{"overall_summary":"strong on fundamentals","strengths":["clarity"],"areas_for_improvement":["testing"],"hiring_recommendation":"Hire"}"#,
        ]);
        let runtime = AgentRuntime::new(model, Duration::from_secs(5), 0);

        let summary = runtime
            .ask(PromptSpec::FinalSummary {
                transcript: "interviewer: hi\ncandidate: hello".into(),
            })
            .await
            .unwrap()
            .into_final_summary()
            .unwrap();
        assert_eq!(summary.hiring_recommendation, "Hire");
        assert_eq!(summary.strengths, vec!["clarity"]);
    }

    #[test]
    fn sanitize_extracts_outer_object() {
        assert_eq!(sanitize_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(sanitize_json("prefix {\"a\":{\"b\":2}} suffix"), "{\"a\":{\"b\":2}}");
        assert_eq!(sanitize_json("no json here"), "no json here");
    }
}
