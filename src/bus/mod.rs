//! Per-session ordered event channel
//!
//! Every component of a session publishes through a `BusHandle` scoped to
//! its producer identity; the Session Controller is the single consumer.
//! Within one producer, submission order is preserved and `seq` is strictly
//! monotonic. Across producers the consumer merges by session timestamp,
//! ties broken by producer priority.
//!
//! The queue is bounded. Under backpressure the oldest coalescible event
//! (`CODE_CHANGED`) is dropped and counted; `SUBMIT_DETECTED`, `INACTIVITY`,
//! `NUDGE_REQUIRED` and terminal events are never dropped.

pub mod bridge;
pub mod recorder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Default queue capacity per session
const DEFAULT_BUS_CAPACITY: usize = 1024;

// ─── Event vocabulary ────────────────────────────────────────────────────

/// Identity of an event producer. Declaration order is priority order:
/// when two producers stamp the same session timestamp, the earlier
/// variant wins the merge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    Controller,
    CodeMonitor,
    Conversation,
    LieDetector,
    Bridge,
}

impl Producer {
    /// Lower value = higher merge priority.
    pub fn priority(self) -> u8 {
        match self {
            Producer::Controller => 0,
            Producer::CodeMonitor => 1,
            Producer::Conversation => 2,
            Producer::LieDetector => 3,
            Producer::Bridge => 4,
        }
    }
}

impl std::fmt::Display for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Producer::Controller => "controller",
            Producer::CodeMonitor => "code_monitor",
            Producer::Conversation => "conversation",
            Producer::LieDetector => "lie_detector",
            Producer::Bridge => "bridge",
        };
        f.write_str(s)
    }
}

/// Error classification carried on system events. This is data, not a type
/// hierarchy: components recover locally and describe what happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Configuration,
    Protocol,
    Contract,
    UserAbort,
}

/// Test runner state as read from the editor's result region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TestState {
    Unknown,
    Running,
    Passed { passed: u32, total: u32 },
    Failed { passed: u32, total: u32 },
}

impl TestState {
    /// True when every test passed.
    pub fn all_passed(self) -> bool {
        matches!(self, TestState::Passed { passed, total } if total > 0 && passed == total)
    }
}

/// Nudge escalation ladder. Ordering is the escalation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NudgeIntensity {
    Polite,
    Firm,
    Aggressive,
    FinalWarning,
}

impl NudgeIntensity {
    /// Next step up the ladder, capped at the top.
    pub fn escalate(self) -> Self {
        match self {
            NudgeIntensity::Polite => NudgeIntensity::Firm,
            NudgeIntensity::Firm => NudgeIntensity::Aggressive,
            NudgeIntensity::Aggressive => NudgeIntensity::FinalWarning,
            NudgeIntensity::FinalWarning => NudgeIntensity::FinalWarning,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NudgeKind {
    Inactivity,
    Lie,
    Progress,
}

/// Why a subordinate process finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Error,
    Interrupted,
    Timeout,
}

/// The set of events a session can record.
///
/// Serialized with `kind` as the discriminant so the event log's closed
/// vocabulary falls straight out of the variant names. Readers ignore
/// kinds they do not recognize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
        candidate: String,
        mode: String,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    TurnCandidate {
        seq: u64,
        text: String,
        confidence: f64,
    },
    TurnInterviewer {
        seq: u64,
        text: String,
        /// Byte offset where TTS was truncated by barge-in, if it was
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated_at: Option<usize>,
    },
    NudgeRequired {
        nudge: NudgeKind,
        intensity: NudgeIntensity,
        prompt_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        claim_id: Option<String>,
    },
    NudgeDelivered {
        turn_seq: u64,
        nudge: NudgeKind,
        intensity: NudgeIntensity,
    },
    LieDetected {
        turn_seq: u64,
        utterance: String,
        confidence: f64,
        category: String,
    },
    CodeChanged {
        question_id: String,
        diff: String,
        chars_changed: usize,
    },
    Inactivity {
        elapsed_secs: u64,
    },
    SubmitDetected {
        question_id: String,
    },
    TestResult {
        question_id: String,
        #[serde(flatten)]
        test: TestState,
    },
    SystemWarning {
        class: ErrorClass,
        message: String,
    },
    SystemError {
        class: ErrorClass,
        message: String,
    },
    AgentOutput {
        message: String,
    },
    AgentError {
        message: String,
    },
    AgentCompleted {
        reason: CompletionReason,
    },
}

impl SessionEvent {
    /// The wire name of this event (the `kind` field of a log record).
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "SESSION_STARTED",
            SessionEvent::SessionEnded { .. } => "SESSION_ENDED",
            SessionEvent::TurnCandidate { .. } => "TURN_CANDIDATE",
            SessionEvent::TurnInterviewer { .. } => "TURN_INTERVIEWER",
            SessionEvent::NudgeRequired { .. } => "NUDGE_REQUIRED",
            SessionEvent::NudgeDelivered { .. } => "NUDGE_DELIVERED",
            SessionEvent::LieDetected { .. } => "LIE_DETECTED",
            SessionEvent::CodeChanged { .. } => "CODE_CHANGED",
            SessionEvent::Inactivity { .. } => "INACTIVITY",
            SessionEvent::SubmitDetected { .. } => "SUBMIT_DETECTED",
            SessionEvent::TestResult { .. } => "TEST_RESULT",
            SessionEvent::SystemWarning { .. } => "SYSTEM_WARNING",
            SessionEvent::SystemError { .. } => "SYSTEM_ERROR",
            SessionEvent::AgentOutput { .. } => "AGENT_OUTPUT",
            SessionEvent::AgentError { .. } => "AGENT_ERROR",
            SessionEvent::AgentCompleted { .. } => "AGENT_COMPLETED",
        }
    }

    /// Events that may be coalesced away under backpressure.
    pub fn coalescible(&self) -> bool {
        matches!(self, SessionEvent::CodeChanged { .. })
    }
}

/// An event stamped with its producer, per-producer sequence number, and
/// session timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub t: DateTime<Utc>,
    pub producer: Producer,
    pub seq: u64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Merge envelopes from multiple producers into a single stable order:
/// session timestamp first, producer priority on ties. Per-producer order
/// is preserved (the sort is stable and seq is monotonic per producer).
pub fn merge_by_timestamp(mut events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
    events.sort_by(|a, b| {
        a.t.cmp(&b.t)
            .then_with(|| a.producer.priority().cmp(&b.producer.priority()))
    });
    events
}

// ─── SessionBus ──────────────────────────────────────────────────────────

struct BusInner {
    queue: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    capacity: usize,
    coalesced: AtomicU64,
    closed: AtomicBool,
}

/// The per-session event queue. Single consumer, many producers.
pub struct SessionBus {
    inner: Arc<BusInner>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
                coalesced: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a publishing handle scoped to one producer. Each handle owns
    /// its own monotonic sequence counter.
    pub fn handle(&self, producer: Producer) -> BusHandle {
        BusHandle {
            producer,
            seq: AtomicU64::new(0),
            bus: Arc::clone(&self.inner),
        }
    }

    /// Receive the next envelope in submission order. Returns `None` once
    /// the bus is closed and drained.
    pub async fn recv(&self) -> Option<EventEnvelope> {
        loop {
            {
                let mut queue = self.inner.queue.lock().await;
                if let Some(env) = queue.pop_front() {
                    return Some(env);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub async fn try_recv(&self) -> Option<EventEnvelope> {
        self.inner.queue.lock().await.pop_front()
    }

    /// Number of `CODE_CHANGED` events dropped under backpressure.
    pub fn coalesced_count(&self) -> u64 {
        self.inner.coalesced.load(Ordering::Relaxed)
    }

    /// Close the bus. Pending events remain receivable; `recv` returns
    /// `None` after the drain.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A producer-scoped publishing handle.
pub struct BusHandle {
    producer: Producer,
    seq: AtomicU64,
    bus: Arc<BusInner>,
}

impl BusHandle {
    pub fn producer(&self) -> Producer {
        self.producer
    }

    /// Publish an event, stamping timestamp and the next sequence number.
    /// Returns the stamped envelope (for callers that mirror events into
    /// their own records).
    pub async fn publish(&self, event: SessionEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            t: Utc::now(),
            producer: self.producer,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            event,
        };

        let mut queue = self.bus.queue.lock().await;
        if queue.len() >= self.bus.capacity {
            // Full: evict the oldest coalescible event. Critical events are
            // never evicted; if nothing is coalescible the queue grows.
            if let Some(pos) = queue.iter().position(|e| e.event.coalescible()) {
                queue.remove(pos);
                self.bus.coalesced.fetch_add(1, Ordering::Relaxed);
            } else if envelope.event.coalescible() {
                self.bus.coalesced.fetch_add(1, Ordering::Relaxed);
                return envelope;
            }
        }
        queue.push_back(envelope.clone());
        drop(queue);
        self.bus.notify.notify_one();
        envelope
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
