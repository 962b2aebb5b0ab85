//! Contract-net task allocation over the blackboard.
//!
//! Tasks are broadcast as `TaskDelegated` requests; agents answer with
//! `TaskBid` events; the round closes on deadline or once every eligible
//! agent has responded, whichever comes first. Zero-bid tasks fall back
//! to direct assignment via the elector's scoring.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::election::LeadershipElector;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{
    AgentId, EventDraft, EventFilter, EventType, Performative, SharedEventLog,
};
use crate::registry::SharedAgentRegistry;

use super::types::{AllocationOutcome, TaskBid, TaskSpec};

/// Source agent id used for allocator-authored events.
const ALLOCATOR_AGENT: &str = "task_allocator";

/// Runs contract-net bidding rounds for a session.
pub struct TaskAllocator {
    log: SharedEventLog,
    registry: SharedAgentRegistry,
    config: CoordinationConfig,
}

impl TaskAllocator {
    pub fn new(
        log: SharedEventLog,
        registry: SharedAgentRegistry,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            log,
            registry,
            config,
        }
    }

    /// Run one allocation round.
    ///
    /// Never fails on unassignable tasks; those are reported in the
    /// outcome. Cancellation aborts the collection window and returns
    /// `Cancelled`.
    pub async fn allocate(
        &self,
        session_id: &str,
        tasks: &[TaskSpec],
        eligible: &[AgentId],
        cancel: &CancellationToken,
    ) -> CoordinationResult<AllocationOutcome> {
        if tasks.is_empty() {
            return Ok(AllocationOutcome::default());
        }

        // Subscribe before broadcasting so no bid can slip past.
        let mut subscription = self.log.subscribe(
            session_id,
            EventFilter::new().types(vec![EventType::TaskBid]),
        )?;

        for task in tasks {
            self.log.append(
                EventDraft::new(
                    session_id,
                    EventType::TaskDelegated,
                    Performative::Request,
                    ALLOCATOR_AGENT,
                )
                .payload(serde_json::to_value(task).unwrap_or_default()),
            )?;
        }

        info!(
            session_id,
            tasks = tasks.len(),
            eligible = eligible.len(),
            window_secs = self.config.bid_window_secs,
            "Bid window opened"
        );

        let bids = self
            .collect_bids(session_id, &mut subscription, tasks, eligible, cancel)
            .await?;

        let mut outcome = AllocationOutcome {
            bids: bids.clone(),
            ..AllocationOutcome::default()
        };

        // Dedupe to one bid per (task, agent); first wins (idempotence
        // under at-least-once delivery).
        let mut by_task: HashMap<&str, Vec<&TaskBid>> = HashMap::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for bid in &bids {
            if !eligible.contains(&bid.agent_id) {
                debug!(agent_id = %bid.agent_id, "Ignoring bid from ineligible agent");
                continue;
            }
            if seen.insert((bid.task_id.clone(), bid.agent_id.clone())) {
                by_task.entry(bid.task_id.as_str()).or_default().push(bid);
            }
        }

        for task in tasks {
            let winner = match by_task.get(task.task_id.as_str()) {
                Some(task_bids) if !task_bids.is_empty() => {
                    Some(self.award(task_bids))
                }
                _ => {
                    warn!(task_id = %task.task_id, "No bids received; falling back to direct assignment");
                    self.direct_assign(task, eligible)
                }
            };

            match winner {
                Some(agent_id) => {
                    if by_task.get(task.task_id.as_str()).is_none() {
                        outcome.fallback_assigned.push(task.task_id.clone());
                    }
                    self.confirm_award(session_id, &task.task_id, &agent_id)?;
                    outcome.assignments.insert(task.task_id.clone(), agent_id);
                }
                None => {
                    warn!(task_id = %task.task_id, "Task unassignable");
                    self.log.append(
                        EventDraft::new(
                            session_id,
                            EventType::TaskDelegated,
                            Performative::Reject,
                            ALLOCATOR_AGENT,
                        )
                        .payload(serde_json::json!({
                            "task_id": task.task_id,
                            "error": "unassignable",
                        })),
                    )?;
                    outcome.unassignable.push(task.task_id.clone());
                }
            }
        }

        info!(
            session_id,
            assigned = outcome.assignments.len(),
            unassignable = outcome.unassignable.len(),
            "Allocation round complete"
        );
        Ok(outcome)
    }

    /// Collect bids until every eligible agent has been heard on every
    /// task or the window closes. Closing on full coverage (not first
    /// response) keeps an agent's later bids from being dropped.
    async fn collect_bids(
        &self,
        session_id: &str,
        subscription: &mut crate::events::Subscription,
        tasks: &[TaskSpec],
        eligible: &[AgentId],
        cancel: &CancellationToken,
    ) -> CoordinationResult<Vec<TaskBid>> {
        let deadline = Instant::now() + self.config.bid_window();
        let mut bids = Vec::new();
        let mut heard: HashSet<(String, String)> = HashSet::new();
        let all_heard = |heard: &HashSet<(String, String)>| {
            tasks.iter().all(|t| {
                eligible
                    .iter()
                    .all(|a| heard.contains(&(t.task_id.clone(), a.clone())))
            })
        };

        while !all_heard(&heard) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(session_id, "Bid window expired");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoordinationError::Cancelled(
                        "bid round aborted".to_string(),
                    ));
                }
                received = timeout(remaining, subscription.recv()) => {
                    match received {
                        Ok(Some(event)) => {
                            match serde_json::from_value::<TaskBid>(event.payload.clone()) {
                                Ok(bid) => {
                                    heard.insert((bid.task_id.clone(), bid.agent_id.clone()));
                                    bids.push(bid);
                                }
                                Err(e) => {
                                    warn!(event_id = %event.id, "Malformed bid payload: {e}");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            debug!(session_id, "Bid window expired");
                            break;
                        }
                    }
                }
            }
        }

        Ok(bids)
    }

    /// Award a task among its bids: highest score; exact ties resolve to
    /// the lower current load, then the lowest agent id.
    fn award(&self, task_bids: &[&TaskBid]) -> AgentId {
        let max_score = task_bids
            .iter()
            .map(|b| b.bid_score())
            .fold(f32::MIN, f32::max);

        let mut tied: Vec<&TaskBid> = task_bids
            .iter()
            .copied()
            .filter(|b| b.bid_score() == max_score)
            .collect();

        tied.sort_by(|a, b| {
            let load_a = self
                .registry
                .get(&a.agent_id)
                .map(|p| p.current_load)
                .unwrap_or(u32::MAX);
            let load_b = self
                .registry
                .get(&b.agent_id)
                .map(|p| p.current_load)
                .unwrap_or(u32::MAX);
            load_a.cmp(&load_b).then(a.agent_id.cmp(&b.agent_id))
        });

        tied[0].agent_id.clone()
    }

    /// Fallback: direct assignment via the elector's scoring restricted
    /// to the task's domain. `None` when no eligible agent matches.
    fn direct_assign(&self, task: &TaskSpec, eligible: &[AgentId]) -> Option<AgentId> {
        let pool: Vec<_> = eligible
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .filter(|p| {
                task.domain_tags.is_empty() || p.capability_match(&task.domain_tags) > 0.0
            })
            .collect();

        LeadershipElector::best_candidate(&pool, &task.domain_tags).map(|(agent_id, _)| agent_id)
    }

    /// Emit the award confirmation and bump the winner's load.
    fn confirm_award(
        &self,
        session_id: &str,
        task_id: &str,
        agent_id: &str,
    ) -> CoordinationResult<()> {
        self.registry.begin_task(agent_id)?;
        self.log.append(
            EventDraft::new(
                session_id,
                EventType::TaskDelegated,
                Performative::Accept,
                ALLOCATOR_AGENT,
            )
            .payload(serde_json::json!({
                "task_id": task_id,
                "agent_id": agent_id,
                "confirmed": true,
            })),
        )?;
        Ok(())
    }
}
