//! Fact oracle
//!
//! Answers "is this utterance consistent with what we know?" in bounded
//! time, purely from the local claim store. The oracle never calls the
//! LLM; it prepares the candidate-fact bundle the verification prompt
//! consumes. Within a session the knowledge base is immutable, so `check`
//! is referentially transparent.

use super::{normalize, Claim, KnowledgeBase};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How many claims a fact bundle carries at most.
const BUNDLE_LIMIT: usize = 8;

/// Score at or above which a claim counts as supporting the utterance.
const SUPPORT_THRESHOLD: f64 = 0.5;

/// Minimum topical overlap for a claim to appear in the bundle at all.
const RELEVANCE_FLOOR: f64 = 0.1;

/// One scored claim inside an oracle report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredClaim {
    pub claim: Claim,
    pub score: f64,
}

/// Result of checking one utterance against the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleReport {
    /// Best-supporting claim, if any scored above the support threshold.
    pub best_match: Option<ScoredClaim>,
    /// Score of the best match (0.0 when nothing was relevant).
    pub score: f64,
    /// Topically related claims that do NOT support the utterance —
    /// the raw material for a contradiction verdict.
    pub contradictions: Vec<ScoredClaim>,
    /// Everything relevant, best first, capped at the bundle limit.
    pub bundle: Vec<ScoredClaim>,
}

impl OracleReport {
    /// Render the bundle for the verification prompt, without exposing
    /// raw artifact text beyond the claims themselves.
    pub fn bundle_for_prompt(&self) -> String {
        if self.bundle.is_empty() {
            return "(no related verified facts)".to_string();
        }
        self.bundle
            .iter()
            .map(|s| {
                format!(
                    "- [{} | {:.2}] {}",
                    s.claim.category.as_str(),
                    s.score,
                    s.claim.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The fact oracle over one immutable knowledge base.
pub struct FactOracle<'a> {
    kb: &'a KnowledgeBase,
}

impl<'a> FactOracle<'a> {
    pub fn new(kb: &'a KnowledgeBase) -> Self {
        Self { kb }
    }

    /// Score every verified claim against the utterance and assemble the
    /// report. The score is monotonic in [0,1]; ties are broken by more
    /// specific category, then longer token overlap, then newer source.
    pub fn check(&self, utterance: &str) -> OracleReport {
        let normalized = normalize(utterance);
        let utterance_tokens: HashSet<&str> = normalized.split_whitespace().collect();

        let mut scored: Vec<(ScoredClaim, usize)> = self
            .kb
            .verified_claims()
            .map(|claim| {
                let (score, overlap) = relevance(&normalized, &utterance_tokens, claim);
                (
                    ScoredClaim {
                        claim: claim.clone(),
                        score,
                    },
                    overlap,
                )
            })
            .filter(|(s, _)| s.score >= RELEVANCE_FLOOR)
            .collect();

        scored.sort_by(|(a, a_overlap), (b, b_overlap)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.claim
                        .category
                        .specificity()
                        .cmp(&a.claim.category.specificity())
                })
                .then_with(|| b_overlap.cmp(a_overlap))
                .then_with(|| b.claim.artifact_stamp.cmp(&a.claim.artifact_stamp))
        });

        let bundle: Vec<ScoredClaim> = scored
            .into_iter()
            .map(|(s, _)| s)
            .take(BUNDLE_LIMIT)
            .collect();

        let best_match = bundle
            .first()
            .filter(|s| s.score >= SUPPORT_THRESHOLD)
            .cloned();
        let score = bundle.first().map(|s| s.score).unwrap_or(0.0);
        let contradictions: Vec<ScoredClaim> = bundle
            .iter()
            .filter(|s| s.score < SUPPORT_THRESHOLD)
            .cloned()
            .collect();

        OracleReport {
            best_match,
            score,
            contradictions,
            bundle,
        }
    }
}

/// Combined relevance of a claim to an utterance: the max of substring
/// containment and token-set similarity. Returns `(score, overlap_tokens)`.
fn relevance(
    normalized_utterance: &str,
    utterance_tokens: &HashSet<&str>,
    claim: &Claim,
) -> (f64, usize) {
    let claim_text = claim.normalized_text.as_str();
    if claim_text.is_empty() || normalized_utterance.is_empty() {
        return (0.0, 0);
    }

    let claim_tokens: HashSet<&str> = claim_text.split_whitespace().collect();
    let overlap = claim_tokens.intersection(utterance_tokens).count();

    // Substring containment: the shorter text fully inside the longer one.
    let containment = if normalized_utterance.contains(claim_text)
        || claim_text.contains(normalized_utterance)
    {
        let shorter = claim_text.len().min(normalized_utterance.len()) as f64;
        let longer = claim_text.len().max(normalized_utterance.len()) as f64;
        shorter / longer
    } else {
        0.0
    };

    // Token-set similarity against the smaller set, so a short claim fully
    // covered by a long utterance still scores high.
    let denom = claim_tokens.len().min(utterance_tokens.len()).max(1) as f64;
    let token_similarity = overlap as f64 / denom;

    (containment.max(token_similarity).clamp(0.0, 1.0), overlap)
}
