//! Append-only conversation log
//!
//! Turns are totally ordered by `seq`; the log is the one piece of state
//! shared across tasks (behind a lock owned by the controller). A
//! non-monotonic append is a contract violation and aborts the session.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Interviewer,
    Candidate,
    System,
    Nudge,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Interviewer => "interviewer",
            Role::Candidate => "candidate",
            Role::System => "system",
            Role::Nudge => "nudge",
        }
    }
}

/// A single committed utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub seq: u64,
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The append-only ordered turn sequence for one session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TurnLog {
    turns: Vec<ConversationTurn>,
    next_seq: u64,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, assigning the next sequence number.
    ///
    /// A candidate turn may only follow a non-candidate turn: the loop
    /// commits exactly one candidate utterance per exchange, so two in a
    /// row means a component lost track of the protocol.
    pub fn append(
        &mut self,
        role: Role,
        text: impl Into<String>,
        t_start: DateTime<Utc>,
        confidence: Option<f64>,
    ) -> Result<&ConversationTurn> {
        if role == Role::Candidate {
            if let Some(last) = self.turns.last() {
                if last.role == Role::Candidate {
                    anyhow::bail!(
                        "contract violation: candidate turn {} directly follows candidate turn {}",
                        self.next_seq + 1,
                        last.seq
                    );
                }
            }
        }

        self.next_seq += 1;
        self.turns.push(ConversationTurn {
            seq: self.next_seq,
            role,
            text: text.into(),
            audio_ref: None,
            t_start,
            t_end: Utc::now(),
            confidence,
        });
        Ok(self.turns.last().expect("just pushed"))
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn get(&self, seq: u64) -> Option<&ConversationTurn> {
        self.turns.iter().find(|t| t.seq == seq)
    }

    /// Candidate turns strictly after `seq`, oldest first.
    pub fn candidate_turns_after(&self, seq: u64) -> impl Iterator<Item = &ConversationTurn> {
        self.turns
            .iter()
            .filter(move |t| t.role == Role::Candidate && t.seq > seq)
    }

    /// Render the most recent `max_turns` turns for prompt context.
    pub fn capped_history(&self, max_turns: usize) -> String {
        let start = self.turns.len().saturating_sub(max_turns);
        self.turns[start..]
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full transcript for the final review.
    pub fn transcript(&self) -> String {
        self.capped_history(usize::MAX)
    }
}
