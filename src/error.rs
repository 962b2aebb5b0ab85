//! Crate-wide error taxonomy for the collaboration core.
//!
//! Component-local recoverable conditions (a late proposal, a timed-out
//! agent, an empty bid round) are absorbed by fallback paths and recorded
//! as events; only terminal failures surface through these variants.

use thiserror::Error;

/// Errors produced by the coordination core.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The session id is not registered with the event log.
    #[error("unknown session: {0}")]
    InvalidSession(String),

    /// A proposal arrived after its collection round closed.
    ///
    /// The engine itself absorbs this condition as a Reject event on the
    /// log; the variant is for embedders surfacing it to their callers.
    #[error("late submission for consensus {consensus_id} round {round}")]
    LateSubmission { consensus_id: String, round: u32 },

    /// Bidding and the direct-assignment fallback were both exhausted.
    #[error("task unassignable: {0}")]
    Unassignable(String),

    /// No agents were available to fill debate roles.
    #[error("consensus failed: {0}")]
    ConsensusFailed(String),

    /// An agent call exceeded its own timeout.
    ///
    /// Inside the core a timed-out call is a non-response handled by the
    /// window that was waiting on it; the variant is for embedders whose
    /// provider wrappers want to report the timeout as an error.
    #[error("agent timed out: {0}")]
    AgentTimeout(String),

    /// A tier-write or write-once violation on the context store.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A context lookup missed (or the entry had expired).
    #[error("not found: {0}")]
    NotFound(String),

    /// The session cancellation token fired mid-round.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Result type for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
