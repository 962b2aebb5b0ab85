//! Consensus records, proposals, and debate arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{AgentId, SessionId};

/// Unique identifier for a consensus process.
pub type ConsensusId = String;

/// Terminal and non-terminal statuses of a consensus process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    /// Rounds still in progress.
    Open,
    /// Proposals converged within the round budget.
    Converged,
    /// Debate synthesis failed validation; the tie-break policy decided.
    Arbitrated,
    /// No agents were available to play debate roles.
    Failed,
}

impl ConsensusStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Whether the process produced a usable result.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Converged | Self::Arbitrated)
    }
}

impl std::fmt::Display for ConsensusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Converged => write!(f, "converged"),
            Self::Arbitrated => write!(f, "arbitrated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error for attempts to finalize an already-terminal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyTerminal {
    pub consensus_id: ConsensusId,
    pub status: ConsensusStatus,
}

impl std::fmt::Display for AlreadyTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "consensus {} already terminal ({})",
            self.consensus_id, self.status
        )
    }
}

impl std::error::Error for AlreadyTerminal {}

/// One agent's proposal within a Delphi round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub consensus_id: ConsensusId,
    pub topic: String,
    /// 1-based round number.
    pub round: u32,
    pub proposing_agent_id: AgentId,
    pub content: String,
    /// Self-reported confidence (0-1).
    pub confidence: f32,
}

/// The durable outcome of one consensus process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub consensus_id: ConsensusId,
    pub session_id: SessionId,
    pub topic: String,
    pub status: ConsensusStatus,
    /// Average pairwise similarity of the final round's proposals.
    pub convergence_score: f32,
    pub final_content: Option<String>,
    pub participating_agents: Vec<AgentId>,
    /// Proposal/feedback rounds actually run.
    pub rounds_run: u32,
    pub created_at: DateTime<Utc>,
}

impl ConsensusRecord {
    /// Open a new record for a topic.
    pub fn new(session_id: &str, topic: &str, participants: &[AgentId]) -> Self {
        Self {
            consensus_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            status: ConsensusStatus::Open,
            convergence_score: 0.0,
            final_content: None,
            participating_agents: participants.to_vec(),
            rounds_run: 0,
            created_at: Utc::now(),
        }
    }

    /// Transition Open → terminal exactly once.
    pub fn finalize(
        &mut self,
        status: ConsensusStatus,
        final_content: Option<String>,
    ) -> Result<(), AlreadyTerminal> {
        if self.status.is_terminal() {
            return Err(AlreadyTerminal {
                consensus_id: self.consensus_id.clone(),
                status: self.status,
            });
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.final_content = final_content;
        Ok(())
    }
}

/// Role of a participant in the structured-debate fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateRole {
    /// Defends the leading proposal.
    Proposer,
    /// Argues the strongest dissenting proposal.
    Challenger,
    /// Synthesizes a final position from both sides.
    Mediator,
    /// Scores arguments for logical consistency.
    Validator,
}

impl std::fmt::Display for DebateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposer => write!(f, "proposer"),
            Self::Challenger => write!(f, "challenger"),
            Self::Mediator => write!(f, "mediator"),
            Self::Validator => write!(f, "validator"),
        }
    }
}

/// One argument advanced during a debate pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateArgument {
    pub debate_id: String,
    pub agent_id: AgentId,
    pub role: DebateRole,
    pub premise: String,
    pub evidence: Vec<String>,
    /// Self-reported confidence, later adjusted by the Mediator.
    pub strength: f32,
}

impl DebateArgument {
    pub fn new(debate_id: &str, agent_id: &str, role: DebateRole, premise: &str) -> Self {
        Self {
            debate_id: debate_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            premise: premise.to_string(),
            evidence: Vec::new(),
            strength: 0.5,
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!ConsensusStatus::Open.is_terminal());
        assert!(ConsensusStatus::Converged.is_terminal());
        assert!(ConsensusStatus::Arbitrated.is_success());
        assert!(!ConsensusStatus::Failed.is_success());
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut record = ConsensusRecord::new("s-1", "topic", &["a-1".to_string()]);
        record
            .finalize(ConsensusStatus::Converged, Some("answer".to_string()))
            .unwrap();
        assert_eq!(record.status, ConsensusStatus::Converged);

        let err = record.finalize(ConsensusStatus::Failed, None).unwrap_err();
        assert_eq!(err.status, ConsensusStatus::Converged);
        // Record unchanged after the rejected transition.
        assert_eq!(record.final_content.as_deref(), Some("answer"));
    }

    #[test]
    fn test_debate_argument_builder() {
        let arg = DebateArgument::new("d-1", "a-1", DebateRole::Proposer, "premise")
            .with_evidence(vec!["fact".to_string()])
            .with_strength(1.5);
        assert_eq!(arg.strength, 1.0); // clamped
        assert_eq!(arg.evidence.len(), 1);
    }
}
