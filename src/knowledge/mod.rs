//! Knowledge base
//!
//! The per-session, read-mostly store of verified claims assembled from a
//! candidate's profile and résumé ingestion artifacts, plus the job
//! description corpus consumed by the scorer. Built once while the session
//! is collecting; immutable from `ready` onward.

pub mod oracle;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use uuid::Uuid;

/// Where a claim came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClaimSource {
    Profile,
    Resume,
    Jobdesc,
}

/// What a claim is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ClaimCategory {
    Experience,
    Education,
    Skill,
    Project,
    Achievement,
    Personal,
}

impl ClaimCategory {
    /// Higher value = more specific, used for oracle tie-breaking.
    pub fn specificity(self) -> u8 {
        match self {
            ClaimCategory::Experience => 6,
            ClaimCategory::Education => 5,
            ClaimCategory::Project => 4,
            ClaimCategory::Achievement => 3,
            ClaimCategory::Skill => 2,
            ClaimCategory::Personal => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimCategory::Experience => "experience",
            ClaimCategory::Education => "education",
            ClaimCategory::Skill => "skill",
            ClaimCategory::Project => "project",
            ClaimCategory::Achievement => "achievement",
            ClaimCategory::Personal => "personal",
        }
    }
}

/// A verified, normalized fact about the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub source: ClaimSource,
    pub category: ClaimCategory,
    pub text: String,
    pub normalized_text: String,
    pub confidence: f64,
    /// Lexicographic timestamp of the artifact this claim came from,
    /// used as a recency tie-breaker.
    pub artifact_stamp: String,
}

impl Claim {
    fn new(
        source: ClaimSource,
        category: ClaimCategory,
        text: impl Into<String>,
        confidence: f64,
        artifact_stamp: &str,
    ) -> Self {
        let text = text.into();
        Self {
            id: Uuid::new_v4().to_string(),
            normalized_text: normalize(&text),
            source,
            category,
            text,
            confidence,
            artifact_stamp: artifact_stamp.to_string(),
        }
    }
}

/// Canonicalize text so substring and fuzzy lookups are deterministic:
/// lower-case, punctuation stripped, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let strip = STRIP.get_or_init(|| Regex::new(r"[^a-z0-9\s]").expect("static regex"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let lowered = text.to_lowercase();
    let stripped = strip.replace_all(&lowered, " ");
    spaces.replace_all(stripped.trim(), " ").to_string()
}

// ─── Ingestion artifacts ─────────────────────────────────────────────────

/// Structured output of the profile/résumé ingestion pipelines. Both
/// pipelines write the same record shape, stamped into the file name as
/// `profile_<ts>.json` / `resume_<ts>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestArtifact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub experience: Vec<ExperienceEntry>,
    #[serde(default)]
    pub education: Vec<EducationEntry>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
    #[serde(default)]
    pub achievements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceEntry {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EducationEntry {
    pub degree: String,
    pub institution: String,
    #[serde(default)]
    pub years: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Parsed job description, written by the ingestion side as
/// `jobdesc_<ts>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDescArtifact {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

// ─── KnowledgeBase ───────────────────────────────────────────────────────

/// Summary counts used in the outcome's source pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDigest {
    pub total_claims: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

/// The immutable, queryable collection of claims for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    claims: Vec<Claim>,
    candidate_name: Option<String>,
    job_description: Vec<String>,
}

impl KnowledgeBase {
    /// Build the knowledge base from the most recent ingestion artifacts
    /// under `ingest_dir`, picked by lexicographic timestamp in the file
    /// name. Profile and résumé claims are merged; duplicates (equal
    /// normalized text within a category) are deduped, résumé winning.
    pub async fn build(ingest_dir: &Path) -> Result<Self> {
        let profile = latest_artifact(ingest_dir, "profile_").await?;
        let resume = latest_artifact(ingest_dir, "resume_").await?;
        let jobdesc = latest_artifact(ingest_dir, "jobdesc_").await?;

        if profile.is_none() && resume.is_none() {
            anyhow::bail!(
                "No profile or resume artifacts found under {}",
                ingest_dir.display()
            );
        }

        let mut claims = Vec::new();
        let mut candidate_name = None;
        let mut job_description = Vec::new();

        // Résumé first so dedup keeps the résumé copy of shared facts.
        for (source, confidence, found) in [
            (ClaimSource::Resume, 0.95, resume),
            (ClaimSource::Profile, 0.85, profile),
        ] {
            let Some((stamp, raw)) = found else { continue };
            let artifact: IngestArtifact = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid {source:?} artifact ({stamp})"))?;
            if candidate_name.is_none() {
                candidate_name = artifact.name.clone();
            }
            flatten_artifact(&artifact, source, confidence, &stamp, &mut claims);
        }

        if let Some((stamp, raw)) = jobdesc {
            let artifact: JobDescArtifact = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid jobdesc artifact ({stamp})"))?;
            for line in artifact
                .requirements
                .iter()
                .chain(artifact.responsibilities.iter())
                .chain(artifact.skills.iter())
            {
                job_description.push(line.clone());
                claims.push(Claim::new(
                    ClaimSource::Jobdesc,
                    ClaimCategory::Skill,
                    line.clone(),
                    1.0,
                    &stamp,
                ));
            }
        }

        let claims = dedupe(claims);
        tracing::info!(
            claims = claims.len(),
            jd_lines = job_description.len(),
            "Knowledge base built"
        );

        Ok(Self {
            claims,
            candidate_name,
            job_description,
        })
    }

    /// Assemble a knowledge base directly from claims (tests, replays).
    pub fn from_claims(claims: Vec<Claim>) -> Self {
        Self {
            claims: dedupe(claims),
            candidate_name: None,
            job_description: Vec::new(),
        }
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Claims eligible for fact checking: profile and résumé only. The
    /// job description is a scoring corpus, not candidate ground truth.
    pub fn verified_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims
            .iter()
            .filter(|c| matches!(c.source, ClaimSource::Profile | ClaimSource::Resume))
    }

    pub fn job_description(&self) -> &[String] {
        &self.job_description
    }

    pub fn get(&self, id: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.id == id)
    }

    /// First name of the candidate, for prompt personalization.
    pub fn candidate_first_name(&self) -> &str {
        self.candidate_name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or("Candidate")
    }

    /// Verified facts rendered for prompt context.
    pub fn facts_for_prompt(&self) -> String {
        self.verified_claims()
            .map(|c| format!("- [{}] {}", c.category.as_str(), c.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn digest(&self) -> KnowledgeDigest {
        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        for claim in &self.claims {
            let source = serde_json::to_value(claim.source)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_source.entry(source).or_default() += 1;
            *by_category
                .entry(claim.category.as_str().to_string())
                .or_default() += 1;
        }
        KnowledgeDigest {
            total_claims: self.claims.len(),
            by_source,
            by_category,
        }
    }
}

fn flatten_artifact(
    artifact: &IngestArtifact,
    source: ClaimSource,
    confidence: f64,
    stamp: &str,
    out: &mut Vec<Claim>,
) {
    if let Some(name) = &artifact.name {
        out.push(Claim::new(
            source,
            ClaimCategory::Personal,
            name.clone(),
            confidence,
            stamp,
        ));
    }
    if let Some(headline) = &artifact.headline {
        out.push(Claim::new(
            source,
            ClaimCategory::Personal,
            headline.clone(),
            confidence,
            stamp,
        ));
    }
    for exp in &artifact.experience {
        let mut text = format!("{} at {}", exp.title, exp.company);
        if let Some(duration) = &exp.duration {
            text.push_str(&format!(", {duration}"));
        }
        out.push(Claim::new(
            source,
            ClaimCategory::Experience,
            text,
            confidence,
            stamp,
        ));
        if let Some(description) = &exp.description {
            out.push(Claim::new(
                source,
                ClaimCategory::Experience,
                description.clone(),
                confidence * 0.9,
                stamp,
            ));
        }
    }
    for edu in &artifact.education {
        out.push(Claim::new(
            source,
            ClaimCategory::Education,
            format!("{} from {}", edu.degree, edu.institution),
            confidence,
            stamp,
        ));
    }
    for skill in &artifact.skills {
        out.push(Claim::new(
            source,
            ClaimCategory::Skill,
            skill.clone(),
            confidence,
            stamp,
        ));
    }
    for project in &artifact.projects {
        let text = match &project.description {
            Some(description) => format!("{}: {}", project.name, description),
            None => project.name.clone(),
        };
        out.push(Claim::new(
            source,
            ClaimCategory::Project,
            text,
            confidence,
            stamp,
        ));
    }
    for achievement in &artifact.achievements {
        out.push(Claim::new(
            source,
            ClaimCategory::Achievement,
            achievement.clone(),
            confidence,
            stamp,
        ));
    }
}

/// Drop claims whose `(category, normalized_text)` already appeared.
fn dedupe(claims: Vec<Claim>) -> Vec<Claim> {
    let mut seen = HashSet::new();
    claims
        .into_iter()
        .filter(|c| seen.insert((c.category, c.normalized_text.clone())))
        .collect()
}

/// Find the lexicographically latest artifact with the given file-name
/// prefix. Returns `(stamp, contents)`.
async fn latest_artifact(dir: &Path, prefix: &str) -> Result<Option<(String, String)>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<String> = None;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read ingest dir {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(".json") {
            if best.as_deref().map(|b| name.as_str() > b).unwrap_or(true) {
                best = Some(name);
            }
        }
    }
    match best {
        Some(name) => {
            let stamp = name
                .trim_start_matches(prefix)
                .trim_end_matches(".json")
                .to_string();
            let contents = tokio::fs::read_to_string(dir.join(&name)).await?;
            Ok(Some((stamp, contents)))
        }
        None => Ok(None),
    }
}
