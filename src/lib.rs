//! Roundtable — a multi-agent collaboration core.
//!
//! Agents coordinate through an append-only per-session event log (the
//! blackboard): tasks are auctioned contract-net style, working state
//! lives in a tiered context store, disagreements run through Delphi
//! consensus rounds with a structured-debate fallback, and every
//! session's output passes a quality gate before its single synthesis
//! event is released.
//!
//! The core is model-agnostic: text generation, semantic similarity,
//! and evidence checking are injected through the traits in
//! [`providers`].

pub mod allocation;
pub mod config;
pub mod consensus;
pub mod context;
pub mod election;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod providers;
pub mod quality;
pub mod registry;
pub mod service;

pub use allocation::{AllocationOutcome, TaskAllocator, TaskBid, TaskId, TaskSpec};
pub use config::CoordinationConfig;
pub use consensus::{
    ConsensusEngine, ConsensusProposal, ConsensusRecord, ConsensusStatus, DebateArgument,
    DebateRole,
};
pub use context::{
    AgentContextEntry, ConsensusGrant, ContextSnapshot, ContextStore, ContextTier,
    SharedContextStore,
};
pub use election::{Election, LeadershipElector, LeadershipRole, RequestFeatures};
pub use error::{CoordinationError, CoordinationResult};
pub use events::{
    AgentId, AppendReceipt, Event, EventDraft, EventFilter, EventId, EventLog, EventType,
    Performative, SessionId, SharedEventLog, Subscription,
};
pub use orchestrator::{
    CollaborationRequest, OrchestrationController, OrchestrationMode, SessionPhase, SessionResult,
};
pub use providers::{
    AgentProvider, BasicEvidenceChecker, EvidenceChecker, Generation, LexicalSimilarity,
    ProviderError, SimilarityScorer,
};
pub use quality::{QualityGate, QualityReport};
pub use registry::{AgentProfile, AgentRegistry, SharedAgentRegistry};
pub use service::CollaborationService;
