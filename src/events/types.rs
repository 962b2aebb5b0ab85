//! Event types for the session blackboard.
//!
//! Events are immutable once appended; corrections are new events that
//! reference the corrected one via `parent_event_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for events.
pub type EventId = String;

/// Unique identifier for collaboration sessions.
pub type SessionId = String;

/// Identifier for a participating agent.
pub type AgentId = String;

/// Category of a blackboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An agent produced content (answer fragment, shared context, proposal).
    Contribution,
    /// Two contributions on the same topic disagree.
    ConflictDetected,
    /// A consensus process reached a terminal successful status.
    ConsensusReached,
    /// A task was broadcast, awarded, or reported unassignable.
    TaskDelegated,
    /// An agent bid on a broadcast task.
    TaskBid,
    /// A leadership role was assigned for the session.
    LeadershipAssigned,
    /// The quality gate recorded its verdict.
    ValidationResult,
    /// Terminal summary of all contributions for the session.
    Synthesis,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contribution => write!(f, "contribution"),
            Self::ConflictDetected => write!(f, "conflict_detected"),
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::TaskDelegated => write!(f, "task_delegated"),
            Self::TaskBid => write!(f, "task_bid"),
            Self::LeadershipAssigned => write!(f, "leadership_assigned"),
            Self::ValidationResult => write!(f, "validation_result"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Speech-act tag describing the communicative intent of an event.
///
/// Used for routing and interpretation: a `Propose` contribution feeds a
/// consensus round, a `Request` delegation opens a bid window, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Performative {
    Inform,
    Request,
    Propose,
    Accept,
    Reject,
    Query,
    Assert,
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inform => write!(f, "inform"),
            Self::Request => write!(f, "request"),
            Self::Propose => write!(f, "propose"),
            Self::Accept => write!(f, "accept"),
            Self::Reject => write!(f, "reject"),
            Self::Query => write!(f, "query"),
            Self::Assert => write!(f, "assert"),
        }
    }
}

/// An immutable entry on the session blackboard.
///
/// `sequence_number` and `logical_timestamp` are assigned atomically by
/// the log at append time, never by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (consumers dedupe on this under at-least-once delivery).
    pub id: EventId,
    /// Session this event belongs to.
    pub session_id: SessionId,
    /// Monotonic, gap-free position within the session.
    pub sequence_number: u64,
    /// Lamport-style counter for causal ordering across concurrent writers.
    pub logical_timestamp: u64,
    /// Event category.
    pub event_type: EventType,
    /// Speech-act tag.
    pub performative: Performative,
    /// The agent (or component) that produced the event.
    pub source_agent_id: AgentId,
    /// Optional causal parent; corrections reference the corrected event.
    pub parent_event_id: Option<EventId>,
    /// Structured content; shape depends on `event_type`.
    pub payload: serde_json::Value,
    /// Wall-clock append time (informational; ordering is by sequence).
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Typed string lookup into the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Typed f64 lookup into the payload.
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    /// Whether this event corrects (supersedes) the given event id.
    pub fn supersedes(&self, event_id: &str) -> bool {
        self.parent_event_id.as_deref() == Some(event_id)
    }
}

/// Caller-supplied portion of an event; the log assigns id, sequence
/// number, Lamport stamp, and timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub session_id: SessionId,
    pub event_type: EventType,
    pub performative: Performative,
    pub source_agent_id: AgentId,
    pub parent_event_id: Option<EventId>,
    pub payload: serde_json::Value,
    /// Highest Lamport stamp the writer has observed, if any. The log
    /// assigns `max(counter, observed) + 1`.
    pub observed_timestamp: Option<u64>,
}

impl EventDraft {
    /// Create a draft with an empty payload.
    pub fn new(
        session_id: &str,
        event_type: EventType,
        performative: Performative,
        source_agent_id: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            event_type,
            performative,
            source_agent_id: source_agent_id.to_string(),
            parent_event_id: None,
            payload: serde_json::Value::Null,
            observed_timestamp: None,
        }
    }

    /// Attach a structured payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Reference a causal parent event.
    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_event_id = Some(parent_id.to_string());
        self
    }

    /// Declare the highest Lamport stamp this writer has observed.
    pub fn observed(mut self, timestamp: u64) -> Self {
        self.observed_timestamp = Some(timestamp);
        self
    }
}

/// Receipt returned by a successful append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub event_id: EventId,
    pub sequence_number: u64,
    pub logical_timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Contribution.to_string(), "contribution");
        assert_eq!(EventType::TaskBid.to_string(), "task_bid");
        assert_eq!(EventType::Synthesis.to_string(), "synthesis");
    }

    #[test]
    fn test_performative_serialization() {
        let json = serde_json::to_string(&Performative::Propose).unwrap();
        assert_eq!(json, "\"propose\"");
        let parsed: Performative = serde_json::from_str("\"assert\"").unwrap();
        assert_eq!(parsed, Performative::Assert);
    }

    #[test]
    fn test_draft_builder() {
        let draft = EventDraft::new("s-1", EventType::Contribution, Performative::Inform, "a-1")
            .payload(serde_json::json!({"key": "topic", "value": 42}))
            .parent("e-0")
            .observed(7);

        assert_eq!(draft.session_id, "s-1");
        assert_eq!(draft.parent_event_id.as_deref(), Some("e-0"));
        assert_eq!(draft.observed_timestamp, Some(7));
        assert_eq!(draft.payload["key"], "topic");
    }
}
