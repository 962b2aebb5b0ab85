//! Contributor workers — one task per participating agent.
//!
//! Workers talk to the rest of the system only through the event log:
//! they watch for delegated tasks and calls for proposals, call their
//! provider, and append the results. A timed-out or failing provider
//! call is a non-response (logged, absorbed), never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocation::{TaskBid, TaskSpec};
use crate::config::CoordinationConfig;
use crate::consensus::ConsensusProposal;
use crate::context::SharedContextStore;
use crate::events::{Event, EventDraft, EventFilter, EventType, Performative, SharedEventLog};
use crate::providers::AgentProvider;
use crate::registry::AgentProfile;

use super::OrchestrationMode;

/// Spawn a contributor loop for one agent. Runs until cancelled.
pub fn spawn_contributor(
    log: SharedEventLog,
    context: SharedContextStore,
    profile: AgentProfile,
    provider: Arc<dyn AgentProvider>,
    mode: OrchestrationMode,
    session_id: &str,
    config: CoordinationConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let session_id = session_id.to_string();
    let subscription = log.subscribe(
        &session_id,
        EventFilter::new().types(vec![EventType::TaskDelegated, EventType::Contribution]),
    );

    tokio::spawn(async move {
        let mut subscription = match subscription {
            Ok(s) => s,
            Err(e) => {
                warn!(agent_id = %profile.agent_id, "Contributor could not subscribe: {e}");
                return;
            }
        };

        let worker = Contributor {
            log,
            context,
            profile,
            provider,
            mode,
            session_id,
            config,
            known_tasks: HashMap::new(),
        };
        worker.run(&mut subscription, cancel).await;
    })
}

struct Contributor {
    log: SharedEventLog,
    context: SharedContextStore,
    profile: AgentProfile,
    provider: Arc<dyn AgentProvider>,
    mode: OrchestrationMode,
    session_id: String,
    config: CoordinationConfig,
    /// Task specs seen in broadcasts, kept so an award can be acted on.
    known_tasks: HashMap<String, TaskSpec>,
}

impl Contributor {
    async fn run(mut self, subscription: &mut crate::events::Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(agent_id = %self.profile.agent_id, "Contributor stopped");
                    return;
                }
                event = subscription.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match (event.event_type, event.performative) {
            (EventType::TaskDelegated, Performative::Request) => {
                self.on_task_broadcast(&event).await;
            }
            (EventType::TaskDelegated, Performative::Accept) => {
                if event.payload_str("agent_id") == Some(self.profile.agent_id.as_str()) {
                    self.on_award(&event).await;
                }
            }
            (EventType::Contribution, Performative::Request) => {
                if event.payload.get("call_for_proposals").is_some() {
                    self.on_call_for_proposals(&event).await;
                }
            }
            _ => {}
        }
    }

    async fn on_task_broadcast(&mut self, event: &Event) {
        let task = match serde_json::from_value::<TaskSpec>(event.payload.clone()) {
            Ok(task) => task,
            Err(_) => return,
        };
        self.known_tasks.insert(task.task_id.clone(), task.clone());

        let capability = self.profile.capability_match(&task.domain_tags);
        match self.mode {
            // Self-selection: act directly when the task fits.
            OrchestrationMode::Choreography => {
                if capability > 0.0 {
                    self.contribute(&task).await;
                }
            }
            // Everything else bids and waits for an award.
            _ => {
                let bid = TaskBid::new(
                    &task.task_id,
                    &self.profile.agent_id,
                    capability,
                    capability,
                    self.profile.availability(),
                );
                let draft = EventDraft::new(
                    &self.session_id,
                    EventType::TaskBid,
                    Performative::Propose,
                    &self.profile.agent_id,
                )
                .payload(serde_json::to_value(&bid).unwrap_or_default());
                if let Err(e) = self.log.append(draft) {
                    warn!(agent_id = %self.profile.agent_id, "Bid not recorded: {e}");
                }
            }
        }
    }

    async fn on_award(&mut self, event: &Event) {
        let Some(task_id) = event.payload_str("task_id") else {
            return;
        };
        let Some(task) = self.known_tasks.get(task_id).cloned() else {
            warn!(
                agent_id = %self.profile.agent_id,
                task_id,
                "Awarded a task never seen in broadcast"
            );
            return;
        };
        self.contribute(&task).await;
    }

    async fn on_call_for_proposals(&mut self, event: &Event) {
        let (Some(consensus_id), Some(topic)) = (
            event.payload_str("consensus_id"),
            event.payload_str("topic"),
        ) else {
            return;
        };
        let round = event.payload["round"].as_u64().unwrap_or(1) as u32;

        let prompt = format!(
            "Propose a position on '{}' (round {}). Prior positions: {}",
            topic, round, event.payload["feedback"],
        );
        let Some(generation) = self.generate(&prompt).await else {
            return;
        };

        let proposal = ConsensusProposal {
            consensus_id: consensus_id.to_string(),
            topic: topic.to_string(),
            round,
            proposing_agent_id: self.profile.agent_id.clone(),
            content: generation.text,
            confidence: generation.confidence,
        };
        let draft = EventDraft::new(
            &self.session_id,
            EventType::Contribution,
            Performative::Propose,
            &self.profile.agent_id,
        )
        .payload(serde_json::to_value(&proposal).unwrap_or_default());
        if let Err(e) = self.log.append(draft) {
            warn!(agent_id = %self.profile.agent_id, "Proposal not recorded: {e}");
        }
    }

    /// Produce a task contribution. A failed or slow provider means no
    /// event; the controller's window handles the silence.
    async fn contribute(&self, task: &TaskSpec) {
        let Some(generation) = self.generate(&task.description).await else {
            return;
        };
        let draft = EventDraft::new(
            &self.session_id,
            EventType::Contribution,
            Performative::Inform,
            &self.profile.agent_id,
        )
        .payload(serde_json::json!({
            "task_id": task.task_id,
            "agent_id": self.profile.agent_id,
            "content": generation.text,
            "confidence": generation.confidence,
        }));
        if let Err(e) = self.log.append(draft) {
            warn!(agent_id = %self.profile.agent_id, "Contribution not recorded: {e}");
        }
    }

    async fn generate(&self, prompt: &str) -> Option<crate::providers::Generation> {
        let snapshot = self.context.snapshot(&self.session_id);
        match timeout(
            self.config.generate_timeout(),
            self.provider
                .generate(&self.profile.agent_id, prompt, &snapshot),
        )
        .await
        {
            Ok(Ok(generation)) => Some(generation),
            Ok(Err(e)) => {
                warn!(agent_id = %self.profile.agent_id, "Provider call failed: {e}");
                None
            }
            Err(_) => {
                warn!(agent_id = %self.profile.agent_id, "Provider call timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStore;
    use crate::events::EventLog;
    use crate::providers::{Generation, ProviderError};
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl AgentProvider for EchoProvider {
        async fn generate(
            &self,
            agent_role: &str,
            prompt: &str,
            _context: &crate::context::ContextSnapshot,
        ) -> Result<Generation, ProviderError> {
            Ok(Generation {
                text: format!("{agent_role}: {prompt}"),
                confidence: 0.8,
            })
        }
    }

    struct SilentProvider;

    #[async_trait]
    impl AgentProvider for SilentProvider {
        async fn generate(
            &self,
            _agent_role: &str,
            _prompt: &str,
            _context: &crate::context::ContextSnapshot,
        ) -> Result<Generation, ProviderError> {
            Err(ProviderError::Failed("backend down".to_string()))
        }
    }

    fn setup(
        mode: OrchestrationMode,
        tags: &[&str],
        provider: Arc<dyn AgentProvider>,
    ) -> (SharedEventLog, CancellationToken) {
        let log = EventLog::new().shared();
        log.open_session("s-1");
        let context = ContextStore::new(log.clone()).shared();
        let cancel = CancellationToken::new();
        spawn_contributor(
            log.clone(),
            context,
            AgentProfile::new("a-1", tags.iter().map(|t| t.to_string())),
            provider,
            mode,
            "s-1",
            CoordinationConfig::default().with_fast_windows(),
            cancel.clone(),
        );
        (log, cancel)
    }

    fn broadcast_task(log: &SharedEventLog, task: &TaskSpec) {
        log.append(
            EventDraft::new(
                "s-1",
                EventType::TaskDelegated,
                Performative::Request,
                "task_allocator",
            )
            .payload(serde_json::to_value(task).unwrap()),
        )
        .unwrap();
    }

    fn watch(
        log: &SharedEventLog,
        event_type: EventType,
        performative: Performative,
    ) -> crate::events::Subscription {
        log.subscribe(
            "s-1",
            EventFilter::new()
                .types(vec![event_type])
                .performative(performative),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_choreography_self_selects_matching_tasks() {
        let (log, cancel) = setup(
            OrchestrationMode::Choreography,
            &["analysis"],
            Arc::new(EchoProvider),
        );
        let mut informs = watch(&log, EventType::Contribution, Performative::Inform);

        broadcast_task(
            &log,
            &TaskSpec::new("t-1", "analyze logs").with_tags(["analysis".to_string()]),
        );

        let contribution = informs.recv().await.unwrap();
        assert_eq!(contribution.payload_str("task_id"), Some("t-1"));
        assert_eq!(contribution.payload_str("agent_id"), Some("a-1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_centralized_bids_then_acts_on_award() {
        let (log, cancel) = setup(
            OrchestrationMode::Centralized,
            &["analysis"],
            Arc::new(EchoProvider),
        );
        let mut bids = watch(&log, EventType::TaskBid, Performative::Propose);
        let mut informs = watch(&log, EventType::Contribution, Performative::Inform);

        broadcast_task(
            &log,
            &TaskSpec::new("t-1", "analyze logs").with_tags(["analysis".to_string()]),
        );

        let bid_event = bids.recv().await.unwrap();
        let bid: TaskBid = serde_json::from_value(bid_event.payload).unwrap();
        assert_eq!(bid.agent_id, "a-1");
        assert!(bid.capability_match > 0.9);

        // No contribution until the award lands.
        assert!(log
            .query(
                "s-1",
                &EventFilter::new()
                    .types(vec![EventType::Contribution])
                    .performative(Performative::Inform),
                0,
            )
            .unwrap()
            .is_empty());

        log.append(
            EventDraft::new(
                "s-1",
                EventType::TaskDelegated,
                Performative::Accept,
                "task_allocator",
            )
            .payload(serde_json::json!({ "task_id": "t-1", "agent_id": "a-1" })),
        )
        .unwrap();

        let contribution = informs.recv().await.unwrap();
        assert_eq!(contribution.payload_str("task_id"), Some("t-1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_answers_call_for_proposals() {
        let (log, cancel) = setup(
            OrchestrationMode::ConsensusFirst,
            &[],
            Arc::new(EchoProvider),
        );
        let mut proposals = watch(&log, EventType::Contribution, Performative::Propose);

        log.append(
            EventDraft::new(
                "s-1",
                EventType::Contribution,
                Performative::Request,
                "facilitator",
            )
            .payload(serde_json::json!({
                "call_for_proposals": true,
                "consensus_id": "c-1",
                "topic": "naming",
                "round": 1,
                "feedback": [],
            })),
        )
        .unwrap();

        let event = proposals.recv().await.unwrap();
        let proposal: ConsensusProposal = serde_json::from_value(event.payload).unwrap();
        assert_eq!(proposal.consensus_id, "c-1");
        assert_eq!(proposal.round, 1);
        assert_eq!(proposal.proposing_agent_id, "a-1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_provider_failure_is_silent() {
        let (log, cancel) = setup(
            OrchestrationMode::Choreography,
            &["analysis"],
            Arc::new(SilentProvider),
        );
        broadcast_task(
            &log,
            &TaskSpec::new("t-1", "analyze logs").with_tags(["analysis".to_string()]),
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(log
            .query(
                "s-1",
                &EventFilter::new()
                    .types(vec![EventType::Contribution])
                    .performative(Performative::Inform),
                0,
            )
            .unwrap()
            .is_empty());
        cancel.cancel();
    }
}
