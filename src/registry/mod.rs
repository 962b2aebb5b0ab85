//! Agent registry — profiles, expertise tags, and capability matching.
//!
//! Profiles are created at registry load, updated after every completed
//! task, and never deleted mid-session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};
use crate::events::AgentId;

/// Shared reference to the registry.
pub type SharedAgentRegistry = Arc<AgentRegistry>;

/// Declared capabilities and track record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Stable agent identifier.
    pub agent_id: AgentId,
    /// Declared expertise tags.
    pub expertise_tags: BTreeSet<String>,
    /// Running success rate over completed tasks (0-1).
    pub historical_success_rate: f32,
    /// Count of active task assignments.
    pub current_load: u32,
    /// Completed task count backing the running success rate.
    pub completed_tasks: u32,
}

impl AgentProfile {
    /// Create a fresh profile with a neutral track record.
    pub fn new(agent_id: &str, expertise_tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            expertise_tags: expertise_tags.into_iter().collect(),
            historical_success_rate: 0.5,
            current_load: 0,
            completed_tasks: 0,
        }
    }

    /// Builder-style override of the starting success rate.
    pub fn with_success_rate(mut self, rate: f32) -> Self {
        self.historical_success_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Expertise overlap with a set of requested tags.
    ///
    /// Defined as |requested ∩ tags| / |requested|; a request with no tags
    /// matches every agent fully.
    pub fn capability_match(&self, requested: &BTreeSet<String>) -> f32 {
        if requested.is_empty() {
            return 1.0;
        }
        let overlap = requested.intersection(&self.expertise_tags).count();
        overlap as f32 / requested.len() as f32
    }

    /// Availability derived from current load (0-1).
    pub fn availability(&self) -> f32 {
        1.0 / (1.0 + self.current_load as f32)
    }
}

/// Static table of available agents for a deployment.
pub struct AgentRegistry {
    profiles: RwLock<BTreeMap<AgentId, AgentProfile>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a shared reference to this registry.
    pub fn shared(self) -> SharedAgentRegistry {
        Arc::new(self)
    }

    /// Register an agent profile, replacing any previous entry.
    pub fn register(&self, profile: AgentProfile) {
        debug!(agent_id = %profile.agent_id, tags = ?profile.expertise_tags, "Agent registered");
        self.profiles
            .write()
            .expect("registry lock poisoned")
            .insert(profile.agent_id.clone(), profile);
    }

    /// Look up a profile by agent id.
    pub fn get(&self, agent_id: &str) -> CoordinationResult<AgentProfile> {
        self.profiles
            .read()
            .expect("registry lock poisoned")
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoordinationError::NotFound(format!("agent {agent_id}")))
    }

    /// All registered profiles, ordered by agent id.
    pub fn all(&self) -> Vec<AgentProfile> {
        self.profiles
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Agents whose expertise overlaps the requested tags.
    pub fn matching(&self, requested: &BTreeSet<String>) -> Vec<AgentProfile> {
        self.all()
            .into_iter()
            .filter(|p| p.capability_match(requested) > 0.0)
            .collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.profiles.read().expect("registry lock poisoned").len()
    }

    /// Whether the registry has no agents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark an agent as holding one more active assignment.
    pub fn begin_task(&self, agent_id: &str) -> CoordinationResult<()> {
        let mut profiles = self.profiles.write().expect("registry lock poisoned");
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("agent {agent_id}")))?;
        profile.current_load += 1;
        Ok(())
    }

    /// Complete an assignment, folding the outcome into the running
    /// success rate.
    pub fn finish_task(&self, agent_id: &str, success: bool) -> CoordinationResult<()> {
        let mut profiles = self.profiles.write().expect("registry lock poisoned");
        let profile = profiles
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("agent {agent_id}")))?;

        profile.current_load = profile.current_load.saturating_sub(1);
        let outcome = if success { 1.0 } else { 0.0 };
        let completed = profile.completed_tasks as f32;
        profile.historical_success_rate =
            (profile.historical_success_rate * completed + outcome) / (completed + 1.0);
        profile.completed_tasks += 1;

        debug!(
            agent_id,
            success,
            rate = profile.historical_success_rate,
            "Task outcome recorded"
        );
        Ok(())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capability_match() {
        let profile = AgentProfile::new("a-1", ["rust".to_string(), "async".to_string()]);

        assert_eq!(profile.capability_match(&tags(&["rust", "async"])), 1.0);
        assert_eq!(profile.capability_match(&tags(&["rust", "sql"])), 0.5);
        assert_eq!(profile.capability_match(&tags(&["sql"])), 0.0);
        // Empty request matches fully.
        assert_eq!(profile.capability_match(&BTreeSet::new()), 1.0);
    }

    #[test]
    fn test_availability_decreases_with_load() {
        let mut profile = AgentProfile::new("a-1", []);
        assert_eq!(profile.availability(), 1.0);
        profile.current_load = 1;
        assert_eq!(profile.availability(), 0.5);
        profile.current_load = 3;
        assert_eq!(profile.availability(), 0.25);
    }

    #[test]
    fn test_success_rate_update() {
        let registry = AgentRegistry::new();
        registry.register(AgentProfile::new("a-1", []).with_success_rate(1.0));

        registry.begin_task("a-1").unwrap();
        registry.finish_task("a-1", false).unwrap();

        let profile = registry.get("a-1").unwrap();
        assert_eq!(profile.completed_tasks, 1);
        assert_eq!(profile.current_load, 0);
        assert!(profile.historical_success_rate < 1.0);

        registry.begin_task("a-1").unwrap();
        registry.finish_task("a-1", true).unwrap();
        let profile = registry.get("a-1").unwrap();
        assert_eq!(profile.completed_tasks, 2);
        assert!(profile.historical_success_rate > 0.0);
    }

    #[test]
    fn test_matching_filters_by_overlap() {
        let registry = AgentRegistry::new();
        registry.register(AgentProfile::new("a-1", ["rust".to_string()]));
        registry.register(AgentProfile::new("a-2", ["sql".to_string()]));

        let matches = registry.matching(&tags(&["rust"]));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].agent_id, "a-1");
    }

    #[test]
    fn test_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(CoordinationError::NotFound(_))
        ));
        assert!(registry.begin_task("ghost").is_err());
    }

    #[test]
    fn test_all_ordered_by_id() {
        let registry = AgentRegistry::new();
        registry.register(AgentProfile::new("b", []));
        registry.register(AgentProfile::new("a", []));

        let ids: Vec<_> = registry.all().into_iter().map(|p| p.agent_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
