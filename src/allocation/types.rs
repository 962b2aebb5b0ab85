//! Task specifications, bids, and allocation outcomes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::events::AgentId;

/// Unique identifier for sub-tasks.
pub type TaskId = String;

/// Bid-score weights: interest, capability match, availability.
const WEIGHT_INTEREST: f32 = 0.3;
const WEIGHT_CAPABILITY: f32 = 0.5;
const WEIGHT_AVAILABILITY: f32 = 0.2;

/// A sub-task broadcast to eligible agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub description: String,
    /// Domain tags used for capability matching and fallback scoring.
    pub domain_tags: BTreeSet<String>,
    /// Whether leaving this task unassigned is a terminal failure for the
    /// request (surfaced in the final issues) rather than a degradation.
    pub required: bool,
}

impl TaskSpec {
    pub fn new(task_id: &str, description: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            description: description.to_string(),
            domain_tags: BTreeSet::new(),
            required: false,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.domain_tags = tags.into_iter().collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// An agent's bid on one task, created during an allocation round and
/// kept only in the round's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBid {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    /// Self-reported interest (0-1).
    pub interest_level: f32,
    /// Expertise-tag overlap with the task (0-1).
    pub capability_match: f32,
    /// Derived from current load (0-1).
    pub availability: f32,
}

impl TaskBid {
    pub fn new(
        task_id: &str,
        agent_id: &str,
        interest_level: f32,
        capability_match: f32,
        availability: f32,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            interest_level: interest_level.clamp(0.0, 1.0),
            capability_match: capability_match.clamp(0.0, 1.0),
            availability: availability.clamp(0.0, 1.0),
        }
    }

    /// Composite score: 0.3·interest + 0.5·capability + 0.2·availability.
    pub fn bid_score(&self) -> f32 {
        WEIGHT_INTEREST * self.interest_level
            + WEIGHT_CAPABILITY * self.capability_match
            + WEIGHT_AVAILABILITY * self.availability
    }
}

/// Result of one contract-net round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationOutcome {
    /// Awarded task → agent mapping.
    pub assignments: BTreeMap<TaskId, AgentId>,
    /// Tasks neither bid on nor directly assignable (reported, non-fatal).
    pub unassignable: Vec<TaskId>,
    /// Every bid received within the window, for auditability.
    pub bids: Vec<TaskBid>,
    /// Tasks awarded via the elector fallback rather than a winning bid.
    pub fallback_assigned: Vec<TaskId>,
}

impl AllocationOutcome {
    /// Whether every task found an agent.
    pub fn fully_assigned(&self) -> bool {
        self.unassignable.is_empty()
    }
}
