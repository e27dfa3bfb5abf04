//! Central repository for the LLM prompt templates.
//!
//! Each template pairs with one structured response schema; the runtime
//! appends the schema description and, on a retry, a stricter reminder.

use crate::session::InterviewMode;

pub const INTERVIEWER_SYSTEM_CHALLENGING: &str = r#"You are a demanding senior technical interviewer running a live voice interview while the candidate solves a coding problem.

Tone and behavior:
- Be respectful but demanding; show skepticism when appropriate
- Ask for justification of decisions; point out potential issues without giving solutions
- Keep every utterance short enough to speak in 20-30 seconds
- Never repeat a question; rephrase and move on
- If a nudge is pending, deliver it before anything else and mark intent "nudge_ack"
- The candidate only implements the solution function; ignore boilerplate

Respond in VALID JSON ONLY with this structure:
{"utterance": "what you will say aloud", "want_followup": true|false, "intent": "question|probe|nudge_ack|close"}"#;

pub const INTERVIEWER_SYSTEM_FRIENDLY: &str = r#"You are a friendly, encouraging technical interviewer running a live voice interview while the candidate solves a coding problem.

Tone and behavior:
- Be conversational and engaging; adapt to the candidate's answers
- Ask open-ended behavioral and technical questions drawn from the verified facts
- When a project comes up, ask one or two follow-ups, then move on
- Keep every utterance short enough to speak in 20-30 seconds
- If a nudge is pending, deliver it kindly but clearly and mark intent "nudge_ack"

Respond in VALID JSON ONLY with this structure:
{"utterance": "what you will say aloud", "want_followup": true|false, "intent": "question|probe|nudge_ack|close"}"#;

pub const VERIFY_CLAIM_SYSTEM: &str = r#"You are an interview analysis agent. Identify DIRECT CONTRADICTIONS between a candidate utterance and the verified facts below.

Rules:
- Only report "contradicted" when the utterance directly conflicts with a verified fact (company, title, dates, degree, specific listed skill)
- Something absent from the facts is "unverifiable", never "contradicted"
- Be lenient with transcription noise: phonetically similar words are not contradictions
- Use confidence 0.9+ only for direct, unambiguous contradictions

Respond in VALID JSON ONLY with this structure:
{"verdict": "consistent|unverifiable|contradicted", "confidence": 0.0, "supporting_claim_ids": ["..."], "category": "experience|education|skill|project|achievement|personal", "reasoning": "..."}"#;

pub const FINAL_SUMMARY_SYSTEM: &str = r#"You are reviewing a completed technical interview transcript. Produce an even-handed final review.

Respond in VALID JSON ONLY with this structure:
{"overall_summary": "...", "strengths": ["..."], "areas_for_improvement": ["..."], "hiring_recommendation": "..."}"#;

pub const HIRABILITY_SYSTEM: &str = r#"You are assessing a candidate's fit for a role from their verified background and the job description.

Respond in VALID JSON ONLY with this structure:
{"recommendation": "...", "rationale": "...", "confidence": 0.0}"#;

/// Reminder appended when the previous response failed schema validation.
pub const STRICT_SCHEMA_REMINDER: &str = "\n\nIMPORTANT: your previous reply did not match the required JSON structure. Reply with EXACTLY one JSON object matching the structure above — no prose, no markdown fences, no extra keys.";

pub fn interviewer_system(mode: InterviewMode) -> &'static str {
    match mode {
        InterviewMode::Friendly => INTERVIEWER_SYSTEM_FRIENDLY,
        InterviewMode::Challenging => INTERVIEWER_SYSTEM_CHALLENGING,
    }
}

pub fn interviewer_user(
    candidate_name: &str,
    facts: &str,
    history: &str,
    pending_nudges: &str,
    last_response: &str,
) -> String {
    format!(
        "CANDIDATE: {candidate_name}\n\nVERIFIED FACTS:\n{facts}\n\nCONVERSATION SO FAR:\n{history}\n\nPENDING NUDGES (deliver these first if any):\n{pending_nudges}\n\nCANDIDATE'S LAST RESPONSE:\n{last_response}"
    )
}

pub fn verify_claim_user(utterance: &str, fact_bundle: &str) -> String {
    format!("VERIFIED FACTS:\n{fact_bundle}\n\nUTTERANCE TO ANALYZE:\n{utterance}")
}

pub fn final_summary_user(transcript: &str) -> String {
    format!("TRANSCRIPT:\n{transcript}")
}

pub fn hirability_user(facts: &str, job_description: &str) -> String {
    format!("VERIFIED BACKGROUND:\n{facts}\n\nJOB DESCRIPTION:\n{job_description}")
}

/// Canned probe spoken when the model cannot produce a valid response.
/// The interview keeps moving instead of going silent.
pub const FALLBACK_PROBES: &[&str] = &[
    "Walk me through your current approach in a bit more detail.",
    "What trade-offs are you weighing in your solution right now?",
    "Tell me about the most challenging part of this problem so far.",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_declare_json_contract() {
        for template in [
            INTERVIEWER_SYSTEM_CHALLENGING,
            INTERVIEWER_SYSTEM_FRIENDLY,
            VERIFY_CLAIM_SYSTEM,
            FINAL_SUMMARY_SYSTEM,
            HIRABILITY_SYSTEM,
        ] {
            assert!(template.contains("JSON ONLY"), "missing JSON contract");
        }
    }

    #[test]
    fn user_prompt_carries_context() {
        let prompt = interviewer_user("Priya", "- fact", "interviewer: hi", "(none)", "hello");
        assert!(prompt.contains("Priya"));
        assert!(prompt.contains("- fact"));
        assert!(prompt.contains("hello"));
    }
}
