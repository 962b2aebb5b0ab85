//! Consumed external capabilities, behind narrow trait seams.
//!
//! The coordination core never depends on a specific model runtime: text
//! generation, semantic similarity, and evidence checking are all injected
//! here, so the core's tests run against deterministic stand-ins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::types::DebateArgument;
use crate::context::ContextSnapshot;

/// Errors from an agent backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The call exceeded its own timeout; treated upstream as a
    /// non-response, never a crash.
    #[error("generate call timed out for {0}")]
    Timeout(String),

    #[error("generate call failed: {0}")]
    Failed(String),
}

/// Output of one agent generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    /// Self-reported confidence (0-1).
    pub confidence: f32,
}

/// Opaque LLM invocation capability.
///
/// The core passes an immutable context snapshot and never holds a lock
/// across this call.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Generate text for the given agent role and prompt.
    async fn generate(
        &self,
        agent_role: &str,
        prompt: &str,
        context: &ContextSnapshot,
    ) -> Result<Generation, ProviderError>;
}

/// Pluggable semantic-similarity capability used for convergence scoring.
pub trait SimilarityScorer: Send + Sync {
    /// Similarity of two texts in [0, 1].
    fn score(&self, a: &str, b: &str) -> f32;
}

/// Pluggable logical-consistency check for debate arguments.
pub trait EvidenceChecker: Send + Sync {
    /// Whether the argument carries evidence and is non-circular.
    fn check(&self, argument: &DebateArgument) -> bool;
}

/// Default similarity scorer: token-set Jaccard over lowercased
/// alphanumeric words.
///
/// Deterministic and dependency-free; deployments inject an
/// embedding-based scorer for real semantic similarity.
#[derive(Debug, Clone, Default)]
pub struct LexicalSimilarity;

impl LexicalSimilarity {
    fn tokens(text: &str) -> std::collections::BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }
}

impl SimilarityScorer for LexicalSimilarity {
    fn score(&self, a: &str, b: &str) -> f32 {
        let ta = Self::tokens(a);
        let tb = Self::tokens(b);
        if ta.is_empty() && tb.is_empty() {
            return 1.0;
        }
        let intersection = ta.intersection(&tb).count();
        let union = ta.union(&tb).count();
        if union == 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }
}

/// Default evidence checker: requires non-empty evidence, none of which
/// merely restates the premise (the circularity test).
#[derive(Debug, Clone, Default)]
pub struct BasicEvidenceChecker;

impl EvidenceChecker for BasicEvidenceChecker {
    fn check(&self, argument: &DebateArgument) -> bool {
        if argument.evidence.is_empty() {
            return false;
        }
        let premise = normalize(&argument.premise);
        argument
            .evidence
            .iter()
            .all(|e| !normalize(e).is_empty() && normalize(e) != premise)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
