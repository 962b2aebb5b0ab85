//! Consensus building: Delphi rounds with a structured-debate fallback.

pub mod debate;
pub mod delphi;
pub mod types;

pub use delphi::ConsensusEngine;
pub use types::{
    AlreadyTerminal, ConsensusId, ConsensusProposal, ConsensusRecord, ConsensusStatus,
    DebateArgument, DebateRole,
};
