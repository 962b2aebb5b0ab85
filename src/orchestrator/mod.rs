//! Session orchestration: mode selection, phases, and the controller.

pub mod controller;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusRecord;
use crate::election::RequestFeatures;
use crate::allocation::TaskSpec;
use crate::events::SessionId;
use crate::quality::QualityReport;

pub use controller::OrchestrationController;
pub use worker::spawn_contributor;

/// How a session coordinates its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Agents self-select tasks off the blackboard; no central awards.
    Choreography,
    /// The allocator runs a bidding round and awards every task.
    Centralized,
    /// Centralized allocation plus conflict detection on the results.
    Hybrid,
    /// Consensus on the request itself before anything else.
    ConsensusFirst,
}

impl std::fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Choreography => write!(f, "choreography"),
            Self::Centralized => write!(f, "centralized"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::ConsensusFirst => write!(f, "consensus_first"),
        }
    }
}

/// Lifecycle phase of a session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Init,
    ModeSelection,
    Contribution,
    ConflictResolution,
    Synthesis,
    Done,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::ModeSelection => write!(f, "mode_selection"),
            Self::Contribution => write!(f, "contribution"),
            Self::ConflictResolution => write!(f, "conflict_resolution"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A caller's request for one collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationRequest {
    /// What the caller wants answered or produced.
    pub description: String,
    /// Features driving elections and mode selection.
    pub features: RequestFeatures,
    /// Pre-decomposed sub-tasks; empty means the request is one task.
    pub tasks: Vec<TaskSpec>,
}

impl CollaborationRequest {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            features: RequestFeatures::default(),
            tasks: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: RequestFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.tasks = tasks;
        self
    }
}

/// Final state of a finished (or cancelled) session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub mode: OrchestrationMode,
    /// The phase the session ended in; `Done` unless it was cut short.
    pub phase: SessionPhase,
    pub final_content: Option<String>,
    pub quality: Option<QualityReport>,
    pub consensus_records: Vec<ConsensusRecord>,
    /// Degradations and failures accumulated along the way.
    pub issues: Vec<String>,
}

/// Pick the coordination mode for a request.
///
/// Precedence: an explicit high-confidence requirement beats everything,
/// then cross-domain requests get conflict detection, and small requests
/// skip central allocation entirely. The caller's `estimated_task_count`
/// counts toward the size check, so an undecomposed request the caller
/// expects to fan out still gets central allocation.
pub fn select_mode(features: &RequestFeatures, task_count: usize) -> OrchestrationMode {
    let effective_count = task_count.max(features.estimated_task_count as usize);
    if features.high_confidence_required {
        OrchestrationMode::ConsensusFirst
    } else if features.cross_domain {
        OrchestrationMode::Hybrid
    } else if effective_count <= 1 {
        OrchestrationMode::Choreography
    } else {
        OrchestrationMode::Centralized
    }
}
