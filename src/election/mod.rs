//! Leadership election — per-round coordination authority.
//!
//! Scores every registered agent on expertise overlap, track record, and
//! inverse load; the selection is deterministic (ties break to the lowest
//! agent id) so repeated elections over the same inputs agree.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{AgentId, EventDraft, EventType, Performative, SessionId, SharedEventLog};
use crate::registry::{AgentProfile, SharedAgentRegistry};

/// Scoring weights: expertise overlap, historical success, inverse load.
const WEIGHT_EXPERTISE: f32 = 0.4;
const WEIGHT_TRACK_RECORD: f32 = 0.3;
const WEIGHT_AVAILABILITY: f32 = 0.3;

/// Roles an elected agent can hold within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadershipRole {
    /// Overall coordination; exactly one per session.
    ProjectManager,
    /// Subject-matter authority for the request's domain.
    DomainLeader,
    /// Runs Delphi rounds.
    ConsensusFacilitator,
    /// Mediates structured debates.
    ConflictMediator,
    /// Scores debate arguments and gate output.
    QualityValidator,
}

impl LeadershipRole {
    pub fn description(&self) -> &'static str {
        match self {
            Self::ProjectManager => "overall coordination and task sequencing",
            Self::DomainLeader => "subject-matter authority",
            Self::ConsensusFacilitator => "delphi round facilitation",
            Self::ConflictMediator => "debate mediation and synthesis",
            Self::QualityValidator => "argument and output validation",
        }
    }
}

impl std::fmt::Display for LeadershipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProjectManager => write!(f, "project_manager"),
            Self::DomainLeader => write!(f, "domain_leader"),
            Self::ConsensusFacilitator => write!(f, "consensus_facilitator"),
            Self::ConflictMediator => write!(f, "conflict_mediator"),
            Self::QualityValidator => write!(f, "quality_validator"),
        }
    }
}

/// Features of the incoming request that drive elections and mode
/// selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFeatures {
    /// Domain expertise tags the request calls for.
    pub domain_tags: BTreeSet<String>,
    /// Caller's estimate of how many sub-tasks the request decomposes into.
    pub estimated_task_count: u32,
    /// Whether the request spans more than one expertise domain.
    pub cross_domain: bool,
    /// Whether the caller asked for high-confidence/consensus output.
    pub high_confidence_required: bool,
}

impl RequestFeatures {
    pub fn new(domain_tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            domain_tags: domain_tags.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Result of one election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub agent_id: AgentId,
    pub role: LeadershipRole,
    pub score: f32,
}

/// Chooses which agent holds coordination authority per round.
pub struct LeadershipElector {
    registry: SharedAgentRegistry,
    log: SharedEventLog,
    /// One holder per (session, role); re-election replaces the holder.
    assignments: Mutex<HashMap<(SessionId, LeadershipRole), AgentId>>,
}

impl LeadershipElector {
    pub fn new(registry: SharedAgentRegistry, log: SharedEventLog) -> Self {
        Self {
            registry,
            log,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Score one candidate against a domain-tag set.
    ///
    /// `max_load` normalizes the load term across the candidate pool
    /// (zero when every candidate is idle).
    pub fn score(profile: &AgentProfile, domain_tags: &BTreeSet<String>, max_load: u32) -> f32 {
        let expertise = profile.capability_match(domain_tags);
        let normalized_load = if max_load == 0 {
            0.0
        } else {
            profile.current_load as f32 / max_load as f32
        };
        WEIGHT_EXPERTISE * expertise
            + WEIGHT_TRACK_RECORD * profile.historical_success_rate
            + WEIGHT_AVAILABILITY * (1.0 - normalized_load)
    }

    /// Pick the best-scoring candidate from a pool, deterministically.
    ///
    /// Candidates are evaluated in ascending agent-id order and a strictly
    /// higher score is required to displace the incumbent, so exact ties
    /// resolve to the lowest agent id.
    pub fn best_candidate(
        candidates: &[AgentProfile],
        domain_tags: &BTreeSet<String>,
    ) -> Option<(AgentId, f32)> {
        let max_load = candidates.iter().map(|p| p.current_load).max().unwrap_or(0);
        let mut sorted: Vec<&AgentProfile> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut best: Option<(AgentId, f32)> = None;
        for profile in sorted {
            let score = Self::score(profile, domain_tags, max_load);
            match &best {
                Some((_, top)) if score <= *top => {}
                _ => best = Some((profile.agent_id.clone(), score)),
            }
        }
        best
    }

    /// Elect an agent into a role for the session, emitting a
    /// `LeadershipAssigned` event. Re-electing a role replaces its holder
    /// (used when request features change between phases).
    pub fn elect(
        &self,
        session_id: &str,
        features: &RequestFeatures,
        role: LeadershipRole,
    ) -> CoordinationResult<Election> {
        let candidates = self.registry.all();
        if candidates.is_empty() {
            return Err(CoordinationError::Unassignable(format!(
                "no registered agents to elect as {role}"
            )));
        }

        let (agent_id, score) = Self::best_candidate(&candidates, &features.domain_tags)
            .ok_or_else(|| {
                CoordinationError::Unassignable(format!("no candidate scored for {role}"))
            })?;

        let replaced = self
            .assignments
            .lock()
            .expect("elector lock poisoned")
            .insert((session_id.to_string(), role), agent_id.clone());

        if let Some(previous) = replaced.filter(|p| p != &agent_id) {
            debug!(session_id, %role, previous, new = %agent_id, "Role reassigned");
        }

        self.log.append(
            EventDraft::new(
                session_id,
                EventType::LeadershipAssigned,
                Performative::Assert,
                &agent_id,
            )
            .payload(serde_json::json!({
                "role": role.to_string(),
                "agent_id": agent_id,
                "score": score,
            })),
        )?;

        info!(session_id, %role, agent_id = %agent_id, score, "Leadership assigned");

        Ok(Election {
            agent_id,
            role,
            score,
        })
    }

    /// Current holder of a role in a session, if any.
    pub fn holder(&self, session_id: &str, role: LeadershipRole) -> Option<AgentId> {
        self.assignments
            .lock()
            .expect("elector lock poisoned")
            .get(&(session_id.to_string(), role))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::events::EventLog;
    use crate::registry::AgentRegistry;

    fn setup(profiles: Vec<AgentProfile>) -> (LeadershipElector, SharedEventLog) {
        let log = EventLog::new().shared();
        log.open_session("s-1");
        let registry = AgentRegistry::new();
        for profile in profiles {
            registry.register(profile);
        }
        (
            LeadershipElector::new(registry.shared(), log.clone()),
            log,
        )
    }

    #[test]
    fn test_expertise_dominates() {
        let (elector, _log) = setup(vec![
            AgentProfile::new("expert", ["rust".to_string()]).with_success_rate(0.5),
            AgentProfile::new("generalist", ["cooking".to_string()]).with_success_rate(0.5),
        ]);

        let features = RequestFeatures::new(["rust".to_string()]);
        let election = elector
            .elect("s-1", &features, LeadershipRole::ProjectManager)
            .unwrap();
        assert_eq!(election.agent_id, "expert");
    }

    #[test]
    fn test_tie_breaks_to_lowest_agent_id() {
        let (elector, _log) = setup(vec![
            AgentProfile::new("beta", ["rust".to_string()]),
            AgentProfile::new("alpha", ["rust".to_string()]),
        ]);

        let features = RequestFeatures::new(["rust".to_string()]);
        let election = elector
            .elect("s-1", &features, LeadershipRole::ProjectManager)
            .unwrap();
        assert_eq!(election.agent_id, "alpha");
    }

    #[test]
    fn test_election_is_reproducible() {
        let (elector, _log) = setup(vec![
            AgentProfile::new("a", ["rust".to_string()]).with_success_rate(0.7),
            AgentProfile::new("b", ["rust".to_string()]).with_success_rate(0.7),
            AgentProfile::new("c", []).with_success_rate(0.9),
        ]);

        let features = RequestFeatures::new(["rust".to_string()]);
        let first = elector
            .elect("s-1", &features, LeadershipRole::DomainLeader)
            .unwrap();
        let second = elector
            .elect("s-1", &features, LeadershipRole::DomainLeader)
            .unwrap();
        assert_eq!(first.agent_id, second.agent_id);
    }

    #[test]
    fn test_loaded_agent_scores_lower() {
        let mut busy = AgentProfile::new("busy", ["rust".to_string()]);
        busy.current_load = 5;
        let idle = AgentProfile::new("idle", ["rust".to_string()]);

        let (elector, _log) = setup(vec![busy, idle]);
        let features = RequestFeatures::new(["rust".to_string()]);
        let election = elector
            .elect("s-1", &features, LeadershipRole::ProjectManager)
            .unwrap();
        assert_eq!(election.agent_id, "idle");
    }

    #[test]
    fn test_emits_leadership_event_and_tracks_holder() {
        let (elector, log) = setup(vec![AgentProfile::new("solo", [])]);
        let features = RequestFeatures::default();

        elector
            .elect("s-1", &features, LeadershipRole::ProjectManager)
            .unwrap();

        assert_eq!(
            elector.holder("s-1", LeadershipRole::ProjectManager),
            Some("solo".to_string())
        );
        let events = log
            .query(
                "s-1",
                &EventFilter::new().types(vec![EventType::LeadershipAssigned]),
                0,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload_str("role"), Some("project_manager"));
    }

    #[test]
    fn test_empty_registry_unassignable() {
        let (elector, _log) = setup(vec![]);
        let err = elector
            .elect(
                "s-1",
                &RequestFeatures::default(),
                LeadershipRole::ProjectManager,
            )
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Unassignable(_)));
    }

    #[test]
    fn test_reelection_replaces_holder() {
        let (elector, _log) = setup(vec![
            AgentProfile::new("a", ["planning".to_string()]),
            AgentProfile::new("b", ["debate".to_string()]),
        ]);

        elector
            .elect(
                "s-1",
                &RequestFeatures::new(["planning".to_string()]),
                LeadershipRole::DomainLeader,
            )
            .unwrap();
        assert_eq!(
            elector.holder("s-1", LeadershipRole::DomainLeader),
            Some("a".to_string())
        );

        // Features change between phases (planning → debate).
        elector
            .elect(
                "s-1",
                &RequestFeatures::new(["debate".to_string()]),
                LeadershipRole::DomainLeader,
            )
            .unwrap();
        assert_eq!(
            elector.holder("s-1", LeadershipRole::DomainLeader),
            Some("b".to_string())
        );
    }
}
