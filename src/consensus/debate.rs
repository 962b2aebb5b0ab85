//! Structured-debate fallback for unconverged consensus processes.
//!
//! When the Delphi round budget is exhausted, the two most opposed
//! positions are argued by their authors, a mediator synthesizes, and a
//! validator scores the synthesis. A failed validation does not loop
//! back into more rounds; the arbitration tie-break decides instead.

use std::collections::BTreeMap;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::election::{LeadershipRole, RequestFeatures};
use crate::events::{AgentId, EventDraft, EventType, Performative};

use super::delphi::ConsensusEngine;
use super::types::{ConsensusProposal, ConsensusRecord, ConsensusStatus, DebateArgument, DebateRole};

impl ConsensusEngine {
    /// Resolve an unconverged process through structured debate.
    ///
    /// Terminal outcomes: `Converged` (validated synthesis), `Arbitrated`
    /// (tie-break), or `Failed` (debate could not be staffed).
    pub(super) async fn escalate_to_debate(
        &self,
        session_id: &str,
        record: &mut ConsensusRecord,
        latest: &BTreeMap<AgentId, ConsensusProposal>,
        cancel: &CancellationToken,
    ) -> CoordinationResult<()> {
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled(
                "debate aborted".to_string(),
            ));
        }

        // A debate needs two distinct positions to argue.
        if latest.len() < 2 {
            warn!(
                session_id,
                consensus_id = %record.consensus_id,
                positions = latest.len(),
                "Debate cannot be staffed; consensus failed"
            );
            return self.fail(session_id, record, "insufficient_positions");
        }

        let features = RequestFeatures::default();
        let mediator = match self.elector.elect(
            session_id,
            &features,
            LeadershipRole::ConflictMediator,
        ) {
            Ok(election) => election,
            Err(e) => {
                warn!(session_id, "No mediator available: {e}");
                return self.fail(session_id, record, "no_mediator");
            }
        };
        let validator = match self.elector.elect(
            session_id,
            &features,
            LeadershipRole::QualityValidator,
        ) {
            Ok(election) => election,
            Err(e) => {
                warn!(session_id, "No validator available: {e}");
                return self.fail(session_id, record, "no_validator");
            }
        };

        let proposals: Vec<&ConsensusProposal> = latest.values().collect();
        let leading = match Self::leading_proposal(&proposals) {
            Some(p) => p,
            None => return self.fail(session_id, record, "insufficient_positions"),
        };
        let dissenting = match self.most_opposed(&proposals, leading) {
            Some(p) => p,
            None => return self.fail(session_id, record, "insufficient_positions"),
        };

        let debate_id = uuid::Uuid::new_v4().to_string();
        info!(
            session_id,
            debate_id,
            proposer = %leading.proposing_agent_id,
            challenger = %dissenting.proposing_agent_id,
            mediator = %mediator.agent_id,
            validator = %validator.agent_id,
            "Debate opened"
        );

        for (proposal, role) in [
            (leading, DebateRole::Proposer),
            (dissenting, DebateRole::Challenger),
        ] {
            let argument = self.build_argument(&debate_id, proposal, role, latest);
            self.log.append(
                EventDraft::new(
                    session_id,
                    EventType::Contribution,
                    Performative::Assert,
                    &argument.agent_id,
                )
                .payload(serde_json::to_value(&argument).unwrap_or_default()),
            )?;
        }

        // Mediator synthesis, then validator verdict; either timing out
        // falls through to arbitration rather than failing the process.
        let snapshot = self.context.snapshot(session_id);
        let prompt = format!(
            "Synthesize a single position on '{}'.\nProposer: {}\nChallenger: {}",
            record.topic, leading.content, dissenting.content,
        );

        let synthesis = match timeout(
            self.config.generate_timeout(),
            self.provider
                .generate(&LeadershipRole::ConflictMediator.to_string(), &prompt, &snapshot),
        )
        .await
        {
            Ok(Ok(generation)) if !generation.text.trim().is_empty() => Some(generation),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(session_id, debate_id, "Mediator synthesis failed: {e}");
                None
            }
            Err(_) => {
                warn!(session_id, debate_id, "Mediator synthesis timed out");
                None
            }
        };

        if let Some(generation) = synthesis {
            let verdict_prompt = format!(
                "Validate this synthesis of '{}': {}",
                record.topic, generation.text,
            );
            let validated = match timeout(
                self.config.generate_timeout(),
                self.provider.generate(
                    &LeadershipRole::QualityValidator.to_string(),
                    &verdict_prompt,
                    &snapshot,
                ),
            )
            .await
            {
                Ok(Ok(verdict)) => verdict.confidence > self.config.quality_threshold,
                Ok(Err(e)) => {
                    warn!(session_id, debate_id, "Validator call failed: {e}");
                    false
                }
                Err(_) => {
                    warn!(session_id, debate_id, "Validator call timed out");
                    false
                }
            };

            if validated {
                Self::close(record, ConsensusStatus::Converged, Some(generation.text))?;
                self.record_success(session_id, record)?;
                return Ok(());
            }
            debug!(session_id, debate_id, "Synthesis rejected by validator; arbitrating");
        }

        let winner = self.arbitrate(latest);
        let content = latest.get(&winner).map(|p| p.content.clone());
        info!(session_id, debate_id, winner = %winner, "Debate arbitrated");
        Self::close(record, ConsensusStatus::Arbitrated, content)?;
        self.record_success(session_id, record)?;
        Ok(())
    }

    /// Close a record as `Failed` with an auditable conflict event.
    fn fail(
        &self,
        session_id: &str,
        record: &mut ConsensusRecord,
        reason: &str,
    ) -> CoordinationResult<()> {
        Self::close(record, ConsensusStatus::Failed, None)?;
        self.log.append(
            EventDraft::new(
                session_id,
                EventType::ConflictDetected,
                Performative::Assert,
                "consensus_engine",
            )
            .payload(serde_json::json!({
                "consensus_id": record.consensus_id,
                "topic": record.topic,
                "reason": "consensus_failed",
                "detail": reason,
            })),
        )?;
        Ok(())
    }

    /// The proposal least similar to the leading one (the strongest
    /// dissent), ties to the lowest agent id.
    fn most_opposed<'a>(
        &self,
        proposals: &[&'a ConsensusProposal],
        leading: &ConsensusProposal,
    ) -> Option<&'a ConsensusProposal> {
        let mut candidates: Vec<&&ConsensusProposal> = proposals
            .iter()
            .filter(|p| p.proposing_agent_id != leading.proposing_agent_id)
            .collect();
        candidates.sort_by(|a, b| a.proposing_agent_id.cmp(&b.proposing_agent_id));

        let mut best: Option<(&'a ConsensusProposal, f32)> = None;
        for proposal in candidates {
            let similarity = self.scorer.score(&leading.content, &proposal.content);
            match best {
                Some((_, lowest)) if similarity >= lowest => {}
                _ => best = Some((*proposal, similarity)),
            }
        }
        best.map(|(p, _)| p)
    }

    /// Build a debate argument from a proposal, citing the other
    /// positions as evidence. Arguments that fail the evidence check
    /// argue at half strength.
    fn build_argument(
        &self,
        debate_id: &str,
        proposal: &ConsensusProposal,
        role: DebateRole,
        latest: &BTreeMap<AgentId, ConsensusProposal>,
    ) -> DebateArgument {
        let evidence: Vec<String> = latest
            .values()
            .filter(|p| p.proposing_agent_id != proposal.proposing_agent_id)
            .map(|p| p.content.clone())
            .collect();

        let argument = DebateArgument::new(
            debate_id,
            &proposal.proposing_agent_id,
            role,
            &proposal.content,
        )
        .with_evidence(evidence)
        .with_strength(proposal.confidence);

        if self.checker.check(&argument) {
            argument
        } else {
            debug!(
                debate_id,
                agent_id = %argument.agent_id,
                "Argument failed the evidence check; strength halved"
            );
            let halved = argument.strength * 0.5;
            argument.with_strength(halved)
        }
    }

    /// Arbitration tie-break: the participant with the best track
    /// record, exact ties to the lowest agent id (BTreeMap iteration
    /// order plus strict displacement).
    fn arbitrate(&self, latest: &BTreeMap<AgentId, ConsensusProposal>) -> AgentId {
        let mut best: Option<(AgentId, f32)> = None;
        for agent_id in latest.keys() {
            let rate = self
                .registry
                .get(agent_id)
                .map(|p| p.historical_success_rate)
                .unwrap_or(0.0);
            match &best {
                Some((_, top)) if rate <= *top => {}
                _ => best = Some((agent_id.clone(), rate)),
            }
        }
        // latest.len() >= 2 was checked before arbitration is reachable.
        best.map(|(id, _)| id).unwrap_or_default()
    }
}
