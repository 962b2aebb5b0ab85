//! Delphi-style consensus rounds.
//!
//! The engine elects a facilitator, announces a call for proposals, and
//! collects one proposal per participant per round. Feedback between
//! rounds is anonymized (content and confidence only, never agent ids).
//! Convergence is the average pairwise similarity of the latest
//! proposals; the round budget is hard — exhausting it escalates to the
//! structured-debate fallback rather than running a fourth round.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::context::{ConsensusGrant, SharedContextStore};
use crate::election::{LeadershipElector, LeadershipRole, RequestFeatures};
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{
    AgentId, Event, EventDraft, EventFilter, EventType, Performative, SharedEventLog,
};
use crate::providers::{
    AgentProvider, BasicEvidenceChecker, EvidenceChecker, LexicalSimilarity, SimilarityScorer,
};
use crate::registry::SharedAgentRegistry;

use super::types::{ConsensusProposal, ConsensusRecord, ConsensusStatus};

/// Runs consensus processes for a session: Delphi rounds first, debate
/// on escalation. Holds the store's consensus-tier write grant.
pub struct ConsensusEngine {
    pub(super) log: SharedEventLog,
    pub(super) context: SharedContextStore,
    pub(super) registry: SharedAgentRegistry,
    pub(super) elector: Arc<LeadershipElector>,
    pub(super) provider: Arc<dyn AgentProvider>,
    pub(super) scorer: Box<dyn SimilarityScorer>,
    pub(super) checker: Box<dyn EvidenceChecker>,
    pub(super) grant: ConsensusGrant,
    pub(super) config: CoordinationConfig,
}

impl ConsensusEngine {
    pub fn new(
        log: SharedEventLog,
        context: SharedContextStore,
        registry: SharedAgentRegistry,
        elector: Arc<LeadershipElector>,
        provider: Arc<dyn AgentProvider>,
        grant: ConsensusGrant,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            log,
            context,
            registry,
            elector,
            provider,
            scorer: Box::new(LexicalSimilarity),
            checker: Box::new(BasicEvidenceChecker),
            grant,
            config,
        }
    }

    /// Replace the default lexical scorer (deployments inject an
    /// embedding-based one).
    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_checker(mut self, checker: Box<dyn EvidenceChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// Run one consensus process to a terminal status.
    ///
    /// The returned record is always terminal; `Failed` is a status, not
    /// an error. Errors are reserved for cancellation and wiring faults.
    pub async fn run(
        &self,
        session_id: &str,
        topic: &str,
        participants: &[AgentId],
        cancel: &CancellationToken,
    ) -> CoordinationResult<ConsensusRecord> {
        if participants.is_empty() {
            return Err(CoordinationError::ConsensusFailed(format!(
                "no participants for topic '{topic}'"
            )));
        }

        let facilitator = self.elector.elect(
            session_id,
            &RequestFeatures::default(),
            LeadershipRole::ConsensusFacilitator,
        )?;

        let mut record = ConsensusRecord::new(session_id, topic, participants);
        // Latest proposal per agent, carried across rounds so a
        // non-resubmitter's position still counts.
        let mut latest: BTreeMap<AgentId, ConsensusProposal> = BTreeMap::new();

        for round in 1..=self.config.max_rounds {
            let window = if round == 1 {
                self.config.proposal_window()
            } else {
                self.config.feedback_window()
            };

            // Subscribe before announcing so no proposal can slip past.
            let mut subscription = self.log.subscribe(
                session_id,
                EventFilter::new()
                    .types(vec![EventType::Contribution])
                    .performative(Performative::Propose),
            )?;

            self.announce_round(
                session_id,
                &facilitator.agent_id,
                &record.consensus_id,
                topic,
                round,
                &latest,
            )?;

            self.collect_round(
                session_id,
                &mut subscription,
                &record.consensus_id,
                round,
                participants,
                &mut latest,
                window,
                cancel,
            )
            .await?;

            record.rounds_run = round;
            let proposals: Vec<&ConsensusProposal> = latest.values().collect();
            record.convergence_score = self.convergence(&proposals);

            info!(
                session_id,
                consensus_id = %record.consensus_id,
                round,
                proposals = proposals.len(),
                convergence = record.convergence_score,
                "Delphi round closed"
            );

            if !proposals.is_empty()
                && record.convergence_score >= self.config.convergence_threshold
            {
                if let Some(winner) = Self::leading_proposal(&proposals) {
                    let content = winner.content.clone();
                    Self::close(&mut record, ConsensusStatus::Converged, Some(content))?;
                    self.record_success(session_id, &record)?;
                    return Ok(record);
                }
            }
        }

        // Round budget exhausted without convergence.
        self.log.append(
            EventDraft::new(
                session_id,
                EventType::ConflictDetected,
                Performative::Assert,
                &facilitator.agent_id,
            )
            .payload(serde_json::json!({
                "consensus_id": record.consensus_id,
                "topic": topic,
                "convergence_score": record.convergence_score,
                "reason": "round_budget_exhausted",
            })),
        )?;

        self.escalate_to_debate(session_id, &mut record, &latest, cancel)
            .await?;
        Ok(record)
    }

    /// Announce a round via a call-for-proposals event. Rounds after the
    /// first carry anonymized feedback from the previous round.
    fn announce_round(
        &self,
        session_id: &str,
        facilitator_id: &str,
        consensus_id: &str,
        topic: &str,
        round: u32,
        latest: &BTreeMap<AgentId, ConsensusProposal>,
    ) -> CoordinationResult<()> {
        // Sorted by content, agent ids stripped: resubmitting agents see
        // positions, never authorship.
        let mut items: Vec<(String, f32)> = latest
            .values()
            .map(|p| (p.content.clone(), p.confidence))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let feedback: Vec<serde_json::Value> = items
            .into_iter()
            .map(|(content, confidence)| {
                serde_json::json!({ "content": content, "confidence": confidence })
            })
            .collect();

        self.log.append(
            EventDraft::new(
                session_id,
                EventType::Contribution,
                Performative::Request,
                facilitator_id,
            )
            .payload(serde_json::json!({
                "call_for_proposals": true,
                "consensus_id": consensus_id,
                "topic": topic,
                "round": round,
                "feedback": feedback,
            })),
        )?;
        Ok(())
    }

    /// Collect proposals until every participant has responded or the
    /// window closes.
    #[allow(clippy::too_many_arguments)]
    async fn collect_round(
        &self,
        session_id: &str,
        subscription: &mut crate::events::Subscription,
        consensus_id: &str,
        round: u32,
        participants: &[AgentId],
        latest: &mut BTreeMap<AgentId, ConsensusProposal>,
        window: Duration,
        cancel: &CancellationToken,
    ) -> CoordinationResult<()> {
        let deadline = Instant::now() + window;
        let mut responded: HashSet<AgentId> = HashSet::new();

        while !participants.iter().all(|a| responded.contains(a)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(consensus_id, round, "Proposal window expired");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoordinationError::Cancelled(
                        "consensus round aborted".to_string(),
                    ));
                }
                received = timeout(remaining, subscription.recv()) => {
                    match received {
                        Ok(Some(event)) => self.handle_proposal(
                            session_id,
                            &event,
                            consensus_id,
                            round,
                            participants,
                            latest,
                            &mut responded,
                        )?,
                        Ok(None) => break,
                        Err(_) => {
                            debug!(consensus_id, round, "Proposal window expired");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate and record one incoming proposal event. Stale-round
    /// submissions are rejected on the log (auditable), never applied.
    fn handle_proposal(
        &self,
        session_id: &str,
        event: &Event,
        consensus_id: &str,
        round: u32,
        participants: &[AgentId],
        latest: &mut BTreeMap<AgentId, ConsensusProposal>,
        responded: &mut HashSet<AgentId>,
    ) -> CoordinationResult<()> {
        let proposal = match serde_json::from_value::<ConsensusProposal>(event.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                debug!(event_id = %event.id, "Ignoring non-proposal contribution: {e}");
                return Ok(());
            }
        };

        if proposal.consensus_id != consensus_id {
            return Ok(());
        }
        if proposal.round < round {
            warn!(
                consensus_id,
                agent_id = %proposal.proposing_agent_id,
                stale_round = proposal.round,
                round,
                "Late submission rejected"
            );
            self.log.append(
                EventDraft::new(
                    session_id,
                    EventType::Contribution,
                    Performative::Reject,
                    &proposal.proposing_agent_id,
                )
                .parent(&event.id)
                .payload(serde_json::json!({
                    "error": "late_submission",
                    "consensus_id": consensus_id,
                    "round": proposal.round,
                })),
            )?;
            return Ok(());
        }
        if proposal.round > round {
            warn!(consensus_id, claimed = proposal.round, round, "Proposal claims a future round");
            return Ok(());
        }
        if !participants.contains(&proposal.proposing_agent_id) {
            debug!(agent_id = %proposal.proposing_agent_id, "Proposal from non-participant ignored");
            return Ok(());
        }
        // One proposal per agent per round; first wins.
        if !responded.insert(proposal.proposing_agent_id.clone()) {
            return Ok(());
        }

        latest.insert(proposal.proposing_agent_id.clone(), proposal);
        Ok(())
    }

    /// Average pairwise similarity of the given proposals. A lone
    /// proposal is trivially converged; none at all is not.
    pub(super) fn convergence(&self, proposals: &[&ConsensusProposal]) -> f32 {
        match proposals.len() {
            0 => 0.0,
            1 => 1.0,
            n => {
                let mut total = 0.0;
                let mut pairs = 0u32;
                for i in 0..n {
                    for j in (i + 1)..n {
                        total += self.scorer.score(&proposals[i].content, &proposals[j].content);
                        pairs += 1;
                    }
                }
                total / pairs as f32
            }
        }
    }

    /// The proposal to adopt on convergence: highest confidence, exact
    /// ties to the lowest agent id.
    pub(super) fn leading_proposal<'a>(
        proposals: &[&'a ConsensusProposal],
    ) -> Option<&'a ConsensusProposal> {
        let mut sorted: Vec<&&ConsensusProposal> = proposals.iter().collect();
        sorted.sort_by(|a, b| a.proposing_agent_id.cmp(&b.proposing_agent_id));

        let mut best: Option<&'a ConsensusProposal> = None;
        for proposal in sorted {
            match best {
                Some(top) if proposal.confidence <= top.confidence => {}
                _ => best = Some(*proposal),
            }
        }
        best
    }

    /// Finalize a record, mapping the exactly-once violation (a logic
    /// bug, not a runtime condition) into the error taxonomy.
    pub(super) fn close(
        record: &mut ConsensusRecord,
        status: ConsensusStatus,
        content: Option<String>,
    ) -> CoordinationResult<()> {
        record
            .finalize(status, content)
            .map_err(|e| CoordinationError::ConsensusFailed(e.to_string()))
    }

    /// Publish a successful terminal record: one `ConsensusReached`
    /// event plus the consensus-tier context entry.
    pub(super) fn record_success(
        &self,
        session_id: &str,
        record: &ConsensusRecord,
    ) -> CoordinationResult<()> {
        self.log.append(
            EventDraft::new(
                session_id,
                EventType::ConsensusReached,
                Performative::Assert,
                "consensus_engine",
            )
            .payload(serde_json::json!({
                "consensus_id": record.consensus_id,
                "topic": record.topic,
                "status": record.status.to_string(),
                "content": record.final_content,
                "convergence_score": record.convergence_score,
                "rounds_run": record.rounds_run,
            })),
        )?;

        // A shared entry under the topic key is promoted as-is; without
        // one the validated outcome is written directly. Write-once
        // either way, so a repeat topic keeps the first validated entry.
        let written = match self.context.promote(&self.grant, session_id, &record.topic) {
            Err(CoordinationError::NotFound(_)) => {
                let entry = serde_json::json!({
                    "content": record.final_content,
                    "consensus_id": record.consensus_id,
                    "status": record.status.to_string(),
                });
                self.context
                    .put_consensus(&self.grant, session_id, &record.topic, entry)
            }
            other => other,
        };
        if let Err(e) = written {
            warn!(session_id, topic = %record.topic, "Consensus entry not written: {e}");
        }
        Ok(())
    }
}
