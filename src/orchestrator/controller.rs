//! The session controller — drives a request through its phases.
//!
//! Init and elections, mode selection, contribution collection, conflict
//! resolution, then exactly one synthesis event and the quality gate.
//! Cancellation is honored at phase boundaries and inside every
//! collection loop; a cancelled session yields a partial result rather
//! than an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocation::{TaskAllocator, TaskId, TaskSpec};
use crate::config::CoordinationConfig;
use crate::consensus::ConsensusEngine;
use crate::context::SharedContextStore;
use crate::election::{LeadershipElector, LeadershipRole};
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{
    AgentId, EventDraft, EventFilter, EventType, Performative, SharedEventLog, Subscription,
};
use crate::providers::{AgentProvider, LexicalSimilarity, SimilarityScorer};
use crate::quality::QualityGate;
use crate::registry::SharedAgentRegistry;

use super::worker::spawn_contributor;
use super::{select_mode, CollaborationRequest, OrchestrationMode, SessionPhase, SessionResult};

/// One contribution accepted for a task.
struct Accepted {
    agent_id: AgentId,
    content: String,
}

/// Coordinates one session at a time; stateless between runs.
pub struct OrchestrationController {
    log: SharedEventLog,
    context: SharedContextStore,
    registry: SharedAgentRegistry,
    elector: Arc<LeadershipElector>,
    allocator: TaskAllocator,
    consensus: ConsensusEngine,
    gate: QualityGate,
    provider: Arc<dyn AgentProvider>,
    scorer: Box<dyn SimilarityScorer>,
    config: CoordinationConfig,
}

impl OrchestrationController {
    /// Wire a controller over shared components. Takes the context
    /// store's consensus grant, so at most one controller per store.
    pub fn new(
        log: SharedEventLog,
        context: SharedContextStore,
        registry: SharedAgentRegistry,
        provider: Arc<dyn AgentProvider>,
        config: CoordinationConfig,
    ) -> CoordinationResult<Self> {
        let elector = Arc::new(LeadershipElector::new(registry.clone(), log.clone()));
        let grant = context.take_consensus_grant().ok_or_else(|| {
            CoordinationError::Forbidden("consensus grant already taken".to_string())
        })?;
        let allocator = TaskAllocator::new(log.clone(), registry.clone(), config.clone());
        let consensus = ConsensusEngine::new(
            log.clone(),
            context.clone(),
            registry.clone(),
            elector.clone(),
            provider.clone(),
            grant,
            config.clone(),
        );
        let gate = QualityGate::new(log.clone(), config.clone());

        Ok(Self {
            log,
            context,
            registry,
            elector,
            allocator,
            consensus,
            gate,
            provider,
            scorer: Box::new(LexicalSimilarity),
            config,
        })
    }

    /// Replace the default lexical scorer used for conflict detection.
    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run a request to completion on an already-opened session.
    ///
    /// Cancellation returns the partial result with a `cancelled` issue;
    /// only wiring faults surface as errors.
    pub async fn run(
        &self,
        session_id: &str,
        request: CollaborationRequest,
        cancel: &CancellationToken,
    ) -> CoordinationResult<SessionResult> {
        if !self.log.session_exists(session_id) {
            return Err(CoordinationError::InvalidSession(session_id.to_string()));
        }
        info!(session_id, phase = %SessionPhase::Init, "Session starting");

        self.elector
            .elect(session_id, &request.features, LeadershipRole::ProjectManager)?;
        if !request.features.domain_tags.is_empty() {
            self.elector
                .elect(session_id, &request.features, LeadershipRole::DomainLeader)?;
        }

        // An undecomposed request is one task covering the whole of it.
        let tasks: Vec<TaskSpec> = if request.tasks.is_empty() {
            vec![TaskSpec::new("t-main", &request.description)
                .with_tags(request.features.domain_tags.iter().cloned())]
        } else {
            request.tasks.clone()
        };

        let mode = select_mode(&request.features, tasks.len());
        info!(session_id, phase = %SessionPhase::ModeSelection, %mode, tasks = tasks.len(), "Mode selected");

        let mut result = SessionResult {
            session_id: session_id.to_string(),
            mode,
            phase: SessionPhase::Init,
            final_content: None,
            quality: None,
            consensus_records: Vec::new(),
            issues: Vec::new(),
        };

        let worker_cancel = cancel.child_token();
        for profile in self.registry.all() {
            spawn_contributor(
                self.log.clone(),
                self.context.clone(),
                profile,
                self.provider.clone(),
                mode,
                session_id,
                self.config.clone(),
                worker_cancel.clone(),
            );
        }

        let outcome = self
            .run_phases(session_id, &request, &tasks, mode, &mut result, cancel)
            .await;
        worker_cancel.cancel();

        match outcome {
            Ok(()) => {
                result.phase = SessionPhase::Done;
                info!(session_id, phase = %SessionPhase::Done, "Session finished");
                Ok(result)
            }
            Err(CoordinationError::Cancelled(_)) => {
                warn!(session_id, phase = %result.phase, "Session cancelled");
                result.issues.push("cancelled".to_string());
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_phases(
        &self,
        session_id: &str,
        request: &CollaborationRequest,
        tasks: &[TaskSpec],
        mode: OrchestrationMode,
        result: &mut SessionResult,
        cancel: &CancellationToken,
    ) -> CoordinationResult<()> {
        let participants: Vec<AgentId> = self
            .registry
            .all()
            .into_iter()
            .map(|p| p.agent_id)
            .collect();

        result.phase = SessionPhase::Contribution;
        let mut contributions: BTreeMap<TaskId, Accepted> = BTreeMap::new();
        let mut assignments: BTreeMap<TaskId, AgentId> = BTreeMap::new();
        let mut awarded: Vec<AgentId> = Vec::new();

        match mode {
            OrchestrationMode::ConsensusFirst => {
                let record = self
                    .consensus
                    .run(session_id, &request.description, &participants, cancel)
                    .await?;
                if !record.status.is_success() {
                    result
                        .issues
                        .push(format!("consensus on request {}", record.status));
                }
                result.consensus_records.push(record);
            }
            OrchestrationMode::Choreography => {
                let mut subscription = self.subscribe_contributions(session_id)?;
                for task in tasks {
                    self.log.append(
                        EventDraft::new(
                            session_id,
                            EventType::TaskDelegated,
                            Performative::Request,
                            "orchestrator",
                        )
                        .payload(serde_json::to_value(task).unwrap_or_default()),
                    )?;
                }
                let expected: Vec<TaskId> = tasks.iter().map(|t| t.task_id.clone()).collect();
                self.collect_contributions(&mut subscription, &expected, &mut contributions, cancel)
                    .await?;
                // Self-selection: whoever answered owns the task.
                for (task_id, accepted) in &contributions {
                    assignments.insert(task_id.clone(), accepted.agent_id.clone());
                }
            }
            OrchestrationMode::Centralized | OrchestrationMode::Hybrid => {
                let mut subscription = self.subscribe_contributions(session_id)?;
                let outcome = self
                    .allocator
                    .allocate(session_id, tasks, &participants, cancel)
                    .await?;
                for task_id in &outcome.unassignable {
                    result.issues.push(format!("task {task_id} unassignable"));
                }
                assignments = outcome.assignments.clone();
                awarded = assignments.values().cloned().collect();

                let expected: Vec<TaskId> = assignments.keys().cloned().collect();
                self.collect_contributions(&mut subscription, &expected, &mut contributions, cancel)
                    .await?;
            }
        }

        if mode != OrchestrationMode::ConsensusFirst {
            for task in tasks {
                if !contributions.contains_key(&task.task_id) && !result.issues.iter().any(|i| i.contains(&task.task_id)) {
                    let severity = if task.required { " (required)" } else { "" };
                    result
                        .issues
                        .push(format!("no contribution for task {}{severity}", task.task_id));
                }
            }
        }

        if mode == OrchestrationMode::Hybrid && contributions.len() >= 2 {
            result.phase = SessionPhase::ConflictResolution;
            if let Some((a, b)) = self.find_conflict(&contributions) {
                warn!(session_id, task_a = %a, task_b = %b, "Divergent contributions; resolving by consensus");
                self.log.append(
                    EventDraft::new(
                        session_id,
                        EventType::ConflictDetected,
                        Performative::Assert,
                        "orchestrator",
                    )
                    .payload(serde_json::json!({
                        "reason": "divergent_contributions",
                        "tasks": [a, b],
                    })),
                )?;
                let record = self
                    .consensus
                    .run(session_id, &request.description, &participants, cancel)
                    .await?;
                if !record.status.is_success() {
                    result
                        .issues
                        .push(format!("conflict resolution {}", record.status));
                }
                result.consensus_records.push(record);
            }
        }

        result.phase = SessionPhase::Synthesis;
        result.final_content = Self::synthesize(&contributions, &result.consensus_records);
        self.log.append(
            EventDraft::new(
                session_id,
                EventType::Synthesis,
                Performative::Assert,
                "orchestrator",
            )
            .payload(serde_json::json!({
                "mode": mode,
                "content": result.final_content,
            })),
        )?;

        let report = self
            .gate
            .validate(session_id, &result.consensus_records, &assignments)?;
        // Close out awarded assignments against the gate verdict.
        awarded.sort();
        awarded.dedup();
        for agent_id in &awarded {
            if let Err(e) = self.registry.finish_task(agent_id, report.passed) {
                warn!(agent_id, "Task outcome not recorded: {e}");
            }
        }
        result.issues.extend(report.issues.iter().cloned());
        result.quality = Some(report);
        Ok(())
    }

    fn subscribe_contributions(&self, session_id: &str) -> CoordinationResult<Subscription> {
        self.log.subscribe(
            session_id,
            EventFilter::new()
                .types(vec![EventType::Contribution])
                .performative(Performative::Inform),
        )
    }

    /// Collect one contribution per expected task, first-wins, until the
    /// window closes.
    async fn collect_contributions(
        &self,
        subscription: &mut Subscription,
        expected: &[TaskId],
        contributions: &mut BTreeMap<TaskId, Accepted>,
        cancel: &CancellationToken,
    ) -> CoordinationResult<()> {
        let deadline = Instant::now() + self.config.contribution_window();

        while !expected.iter().all(|t| contributions.contains_key(t)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoordinationError::Cancelled(
                        "contribution collection aborted".to_string(),
                    ));
                }
                received = timeout(remaining, subscription.recv()) => {
                    match received {
                        Ok(Some(event)) => {
                            let (Some(task_id), Some(agent_id), Some(content)) = (
                                event.payload_str("task_id"),
                                event.payload_str("agent_id"),
                                event.payload_str("content"),
                            ) else {
                                continue;
                            };
                            if expected.iter().any(|t| t == task_id)
                                && !contributions.contains_key(task_id)
                            {
                                contributions.insert(
                                    task_id.to_string(),
                                    Accepted {
                                        agent_id: agent_id.to_string(),
                                        content: content.to_string(),
                                    },
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// First pair of contributions that diverge below the convergence
    /// threshold, if any.
    fn find_conflict(&self, contributions: &BTreeMap<TaskId, Accepted>) -> Option<(TaskId, TaskId)> {
        let entries: Vec<(&TaskId, &Accepted)> = contributions.iter().collect();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let similarity = self
                    .scorer
                    .score(&entries[i].1.content, &entries[j].1.content);
                if similarity < self.config.convergence_threshold {
                    return Some((entries[i].0.clone(), entries[j].0.clone()));
                }
            }
        }
        None
    }

    /// Fold contributions and consensus outcomes into the final text.
    fn synthesize(
        contributions: &BTreeMap<TaskId, Accepted>,
        records: &[crate::consensus::ConsensusRecord],
    ) -> Option<String> {
        let mut sections: Vec<String> = contributions
            .iter()
            .map(|(task_id, accepted)| format!("[{task_id}] {}", accepted.content))
            .collect();
        for record in records {
            if let Some(content) = &record.final_content {
                sections.push(format!("[consensus: {}] {content}", record.topic));
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n"))
        }
    }
}
