//! Hirability scorer
//!
//! Keyword-category scoring of the candidate's verified claims against the
//! job description. A match that the job description also mentions scores
//! 2, a non-required claim scores 1, and each category normalizes against
//! a fixed denominator. The weighted overall score maps to a
//! recommendation band; fractions are floored so band edges resolve
//! conservatively.

use crate::bus::TestState;
use crate::conversation::turns::{ConversationTurn, Role};
use crate::knowledge::{ClaimSource, KnowledgeBase};
use crate::monitor::SnapshotSummary;
use serde::{Deserialize, Serialize};

/// Category sub-scores plus the weighted overall, floats in [0,100] with
/// one decimal place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Scores {
    pub technical: f64,
    pub ai_ml: f64,
    pub experience: f64,
    pub education: f64,
    pub soft: f64,
    pub overall: f64,
}

struct Category {
    weight: f64,
    keywords: &'static [&'static str],
}

const TECHNICAL: Category = Category {
    weight: 0.30,
    keywords: &[
        "python", "javascript", "typescript", "react", "vue", "angular", "node", "flask",
        "django", "java", "rust", "sql", "nosql", "mongodb", "postgresql", "mysql", "api",
        "rest", "graphql", "aws", "gcp", "azure", "cloud", "docker", "kubernetes", "git",
        "devops", "microservices", "html", "css",
    ],
};

const AI_ML: Category = Category {
    weight: 0.25,
    keywords: &[
        "machine learning", "artificial intelligence", "ai", "ml", "pytorch", "tensorflow",
        "deep learning", "neural network", "data science", "nlp", "computer vision", "model",
        "algorithm", "pandas", "numpy", "scikit", "keras", "opencv",
    ],
};

const EXPERIENCE: Category = Category {
    weight: 0.20,
    keywords: &[
        "senior", "lead", "architect", "manager", "years", "experience", "internship",
        "full time", "engineer", "developer", "software", "project", "team", "leadership",
        "mentoring",
    ],
};

const EDUCATION: Category = Category {
    weight: 0.15,
    keywords: &[
        "computer science", "software engineering", "engineering", "bachelor", "master", "phd",
        "degree", "university", "college", "gpa", "coursework", "certification",
    ],
};

const SOFT: Category = Category {
    weight: 0.10,
    keywords: &[
        "communication", "collaboration", "teamwork", "problem solving", "leadership", "agile",
        "scrum", "project management", "analytical", "creative", "innovation", "documentation",
    ],
};

/// Floor to one decimal place. Flooring (not rounding) keeps band-edge
/// ties conservative.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).floor() / 10.0
}

fn category_score(candidate_text: &str, jd_text: &str, category: &Category) -> f64 {
    let mut raw = 0u32;
    for keyword in category.keywords {
        if candidate_text.contains(keyword) {
            raw += if jd_text.contains(keyword) { 2 } else { 1 };
        }
    }
    let denominator = (category.keywords.len() * 2) as f64;
    round1((f64::from(raw) / denominator * 100.0).min(100.0))
}

/// Score the candidate's profile/résumé claims against the job
/// description corpus.
pub fn score_candidate(kb: &KnowledgeBase) -> Scores {
    let candidate_text = kb
        .claims()
        .iter()
        .filter(|c| matches!(c.source, ClaimSource::Profile | ClaimSource::Resume))
        .map(|c| c.normalized_text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let jd_text = kb
        .job_description()
        .iter()
        .map(|line| crate::knowledge::normalize(line))
        .collect::<Vec<_>>()
        .join(" ");

    let technical = category_score(&candidate_text, &jd_text, &TECHNICAL);
    let ai_ml = category_score(&candidate_text, &jd_text, &AI_ML);
    let experience = category_score(&candidate_text, &jd_text, &EXPERIENCE);
    let education = category_score(&candidate_text, &jd_text, &EDUCATION);
    let soft = category_score(&candidate_text, &jd_text, &SOFT);

    let overall = round1(
        technical * TECHNICAL.weight
            + ai_ml * AI_ML.weight
            + experience * EXPERIENCE.weight
            + education * EDUCATION.weight
            + soft * SOFT.weight,
    );

    Scores {
        technical,
        ai_ml,
        experience,
        education,
        soft,
        overall,
    }
}

/// Recommendation bands over the overall score.
pub fn recommendation(overall: f64) -> &'static str {
    if overall >= 80.0 {
        "Strong Hire"
    } else if overall >= 65.0 {
        "Hire"
    } else if overall >= 50.0 {
        "Weak Hire"
    } else if overall >= 35.0 {
        "Weak No Hire"
    } else {
        "No Hire"
    }
}

/// Code score from the final test state: the pass ratio, scaled to 100.
pub fn code_score(snapshots: &SnapshotSummary) -> f64 {
    match snapshots.final_test_state {
        Some(TestState::Passed { passed, total }) | Some(TestState::Failed { passed, total })
            if total > 0 =>
        {
            round1(f64::from(passed) / f64::from(total) * 100.0)
        }
        _ => 0.0,
    }
}

/// Communication score from turn statistics: participation plus answer
/// depth.
pub fn communication_score(turns: &[ConversationTurn]) -> f64 {
    let candidate_turns: Vec<&ConversationTurn> =
        turns.iter().filter(|t| t.role == Role::Candidate).collect();
    if candidate_turns.is_empty() {
        return 0.0;
    }
    let participation = (candidate_turns.len() as f64 * 10.0).min(50.0);
    let total_words: usize = candidate_turns
        .iter()
        .map(|t| t.text.split_whitespace().count())
        .sum();
    let avg_words = total_words as f64 / candidate_turns.len() as f64;
    let depth = (avg_words * 5.0).min(50.0);
    round1(participation + depth)
}

/// Rough estimate of total experience years mentioned across claims.
pub fn estimated_experience_years(kb: &KnowledgeBase) -> f64 {
    let pattern = regex::Regex::new(r"(\d+)\s*(years?|yrs?)").expect("static regex");
    let mut years = 0.0;
    for claim in kb.claims() {
        for capture in pattern.captures_iter(&claim.normalized_text) {
            if let Ok(n) = capture[1].parse::<f64>() {
                years += n;
            }
        }
    }
    years.min(40.0)
}
