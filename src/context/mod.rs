//! Tiered context store — private, shared, and consensus working state.
//!
//! Shared-tier writes are broadcast through the event log as Contribution
//! events, so subscribers see them without additional locking. The
//! consensus tier is guarded by an unforgeable `ConsensusGrant` handle
//! that only the consensus engine holds.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{EventDraft, EventType, Performative, SessionId, SharedEventLog};

/// Shared reference to the context store.
pub type SharedContextStore = Arc<ContextStore>;

/// Visibility tier of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    /// Visible only to the writing agent.
    Private,
    /// Visible to every agent in the session.
    Shared,
    /// Validated knowledge; written only by the consensus engine.
    Consensus,
}

impl std::fmt::Display for ContextTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Shared => write!(f, "shared"),
            Self::Consensus => write!(f, "consensus"),
        }
    }
}

/// A context entry as returned to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContextEntry {
    pub session_id: SessionId,
    pub tier: ContextTier,
    pub key: String,
    pub value: serde_json::Value,
    /// Monotonic per key within its tier.
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Capability handle authorizing consensus-tier writes.
///
/// Obtainable exactly once per store via `take_consensus_grant`; holding
/// it is the only way to write or promote into the consensus tier.
pub struct ConsensusGrant {
    _private: (),
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: serde_json::Value,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn unset() -> Self {
        Self {
            value: serde_json::Value::Null,
            version: 0,
            expires_at: None,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct ContextInner {
    /// Keyed by (agent, session, key) — the keying itself enforces
    /// private visibility.
    private: HashMap<(String, SessionId, String), StoredValue>,
    shared: HashMap<(SessionId, String), StoredValue>,
    consensus: HashMap<(SessionId, String), StoredValue>,
}

/// Keyed storage for agent working state, partitioned by visibility tier.
pub struct ContextStore {
    log: SharedEventLog,
    inner: Mutex<ContextInner>,
    grant_taken: AtomicBool,
}

impl ContextStore {
    /// Create a store backed by the given event log.
    pub fn new(log: SharedEventLog) -> Self {
        Self {
            log,
            inner: Mutex::new(ContextInner::default()),
            grant_taken: AtomicBool::new(false),
        }
    }

    /// Create a shared reference to this store.
    pub fn shared(self) -> SharedContextStore {
        Arc::new(self)
    }

    /// Take the consensus-tier write capability. Returns `None` after the
    /// first call; the consensus engine takes it at wiring time.
    pub fn take_consensus_grant(&self) -> Option<ConsensusGrant> {
        if self.grant_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ConsensusGrant { _private: () })
    }

    /// Read a context entry.
    ///
    /// Private entries are only reachable by their owner (the keying makes
    /// other agents' entries `NotFound`). Expired entries read as missing.
    pub fn get(
        &self,
        agent_id: &str,
        session_id: &str,
        tier: ContextTier,
        key: &str,
    ) -> CoordinationResult<AgentContextEntry> {
        let inner = self.inner.lock().expect("context lock poisoned");
        let stored = match tier {
            ContextTier::Private => inner.private.get(&(
                agent_id.to_string(),
                session_id.to_string(),
                key.to_string(),
            )),
            ContextTier::Shared => inner.shared.get(&(session_id.to_string(), key.to_string())),
            ContextTier::Consensus => inner
                .consensus
                .get(&(session_id.to_string(), key.to_string())),
        };

        let stored = stored
            .filter(|v| !v.expired(Utc::now()))
            .ok_or_else(|| CoordinationError::NotFound(format!("{tier}/{key}")))?;

        Ok(AgentContextEntry {
            session_id: session_id.to_string(),
            tier,
            key: key.to_string(),
            value: stored.value.clone(),
            version: stored.version,
            expires_at: stored.expires_at,
        })
    }

    /// Write a private- or shared-tier entry, returning the new version.
    ///
    /// Consensus-tier writes fail with `Forbidden`; use
    /// [`ContextStore::put_consensus`] with the grant instead. Shared
    /// writes are broadcast through the event log so other agents can
    /// subscribe to them.
    pub fn put(
        &self,
        agent_id: &str,
        session_id: &str,
        tier: ContextTier,
        key: &str,
        value: serde_json::Value,
    ) -> CoordinationResult<u64> {
        self.put_with_expiry(agent_id, session_id, tier, key, value, None)
    }

    /// `put` with an optional expiry timestamp.
    pub fn put_with_expiry(
        &self,
        agent_id: &str,
        session_id: &str,
        tier: ContextTier,
        key: &str,
        value: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoordinationResult<u64> {
        if tier == ContextTier::Consensus {
            return Err(CoordinationError::Forbidden(
                "consensus tier is written only by the consensus engine".to_string(),
            ));
        }
        if !self.log.session_exists(session_id) {
            return Err(CoordinationError::InvalidSession(session_id.to_string()));
        }

        let version = {
            let mut inner = self.inner.lock().expect("context lock poisoned");
            // The two maps have different key shapes, so each arm resolves
            // its own entry.
            let stored = match tier {
                ContextTier::Private => inner
                    .private
                    .entry((
                        agent_id.to_string(),
                        session_id.to_string(),
                        key.to_string(),
                    ))
                    .or_insert_with(StoredValue::unset),
                ContextTier::Shared => inner
                    .shared
                    .entry((session_id.to_string(), key.to_string()))
                    .or_insert_with(StoredValue::unset),
                ContextTier::Consensus => unreachable!("rejected above"),
            };
            stored.version += 1;
            stored.value = value.clone();
            stored.expires_at = expires_at;
            stored.version
        };

        if tier == ContextTier::Shared {
            self.log.append(
                EventDraft::new(
                    session_id,
                    EventType::Contribution,
                    Performative::Inform,
                    agent_id,
                )
                .payload(serde_json::json!({
                    "context_key": key,
                    "value": value,
                    "version": version,
                })),
            )?;
        }

        debug!(agent_id, session_id, %tier, key, version, "Context entry written");
        Ok(version)
    }

    /// Write a consensus-tier entry directly. Grant-holders only; entries
    /// are write-once.
    pub fn put_consensus(
        &self,
        _grant: &ConsensusGrant,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> CoordinationResult<u64> {
        let mut inner = self.inner.lock().expect("context lock poisoned");
        let slot = (session_id.to_string(), key.to_string());
        if inner.consensus.contains_key(&slot) {
            return Err(CoordinationError::Forbidden(format!(
                "consensus entry {key} is write-once"
            )));
        }
        inner.consensus.insert(
            slot,
            StoredValue {
                value,
                version: 1,
                expires_at: None,
            },
        );
        debug!(session_id, key, "Consensus entry written");
        Ok(1)
    }

    /// Promote a shared entry to the consensus tier. Grant-holders only,
    /// and only after the owning consensus record converged.
    pub fn promote(
        &self,
        grant: &ConsensusGrant,
        session_id: &str,
        key: &str,
    ) -> CoordinationResult<u64> {
        let value = {
            let inner = self.inner.lock().expect("context lock poisoned");
            inner
                .shared
                .get(&(session_id.to_string(), key.to_string()))
                .filter(|v| !v.expired(Utc::now()))
                .map(|v| v.value.clone())
                .ok_or_else(|| CoordinationError::NotFound(format!("shared/{key}")))?
        };
        self.put_consensus(grant, session_id, key, value)
    }

    /// Immutable snapshot of the shared and consensus tiers for one
    /// session, passed to agent calls so they never touch the store (or
    /// its lock) directly.
    pub fn snapshot(&self, session_id: &str) -> ContextSnapshot {
        let inner = self.inner.lock().expect("context lock poisoned");
        let now = Utc::now();

        let collect = |map: &HashMap<(SessionId, String), StoredValue>| {
            map.iter()
                .filter(|((sid, _), v)| sid == session_id && !v.expired(now))
                .map(|((_, key), v)| (key.clone(), v.value.clone()))
                .collect::<BTreeMap<_, _>>()
        };

        ContextSnapshot {
            session_id: session_id.to_string(),
            shared: collect(&inner.shared),
            consensus: collect(&inner.consensus),
        }
    }
}

/// Immutable view of a session's shared and consensus context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub session_id: SessionId,
    pub shared: BTreeMap<String, serde_json::Value>,
    pub consensus: BTreeMap<String, serde_json::Value>,
}

impl ContextSnapshot {
    /// An empty snapshot for sessions with no context yet.
    pub fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            shared: BTreeMap::new(),
            consensus: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventLog};
    use chrono::Duration;

    fn store() -> ContextStore {
        let log = EventLog::new().shared();
        log.open_session("s-1");
        ContextStore::new(log)
    }

    #[test]
    fn test_private_entries_invisible_to_other_agents() {
        let store = store();
        store
            .put(
                "a-1",
                "s-1",
                ContextTier::Private,
                "notes",
                serde_json::json!("draft"),
            )
            .unwrap();

        assert!(store.get("a-1", "s-1", ContextTier::Private, "notes").is_ok());
        assert!(matches!(
            store.get("a-2", "s-1", ContextTier::Private, "notes"),
            Err(CoordinationError::NotFound(_))
        ));
    }

    #[test]
    fn test_shared_put_broadcasts_event() {
        let store = store();
        store
            .put(
                "a-1",
                "s-1",
                ContextTier::Shared,
                "topic",
                serde_json::json!("analysis"),
            )
            .unwrap();

        let events = store
            .log
            .query("s-1", &EventFilter::new().types(vec![EventType::Contribution]), 0)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload_str("context_key"), Some("topic"));

        // Readable by any agent.
        let entry = store.get("a-2", "s-1", ContextTier::Shared, "topic").unwrap();
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn test_versions_monotonic_per_key() {
        let store = store();
        for expected in 1..=3u64 {
            let version = store
                .put(
                    "a-1",
                    "s-1",
                    ContextTier::Shared,
                    "k",
                    serde_json::json!(expected),
                )
                .unwrap();
            assert_eq!(version, expected);
        }
    }

    #[test]
    fn test_private_and_shared_tiers_version_independently() {
        let store = store();
        // The same key through both write paths must not collide.
        let p1 = store
            .put("a-1", "s-1", ContextTier::Private, "k", serde_json::json!(1))
            .unwrap();
        let s1 = store
            .put("a-1", "s-1", ContextTier::Shared, "k", serde_json::json!(2))
            .unwrap();
        let p2 = store
            .put("a-1", "s-1", ContextTier::Private, "k", serde_json::json!(3))
            .unwrap();
        assert_eq!((p1, s1, p2), (1, 1, 2));

        let private = store.get("a-1", "s-1", ContextTier::Private, "k").unwrap();
        let shared = store.get("a-1", "s-1", ContextTier::Shared, "k").unwrap();
        assert_eq!(private.value, serde_json::json!(3));
        assert_eq!(shared.value, serde_json::json!(2));
    }

    #[test]
    fn test_consensus_put_forbidden_without_grant() {
        let store = store();
        let err = store
            .put(
                "a-1",
                "s-1",
                ContextTier::Consensus,
                "k",
                serde_json::json!(1),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Forbidden(_)));
    }

    #[test]
    fn test_grant_taken_once() {
        let store = store();
        assert!(store.take_consensus_grant().is_some());
        assert!(store.take_consensus_grant().is_none());
    }

    #[test]
    fn test_promote_and_write_once() {
        let store = store();
        let grant = store.take_consensus_grant().unwrap();

        store
            .put(
                "a-1",
                "s-1",
                ContextTier::Shared,
                "answer",
                serde_json::json!("42"),
            )
            .unwrap();

        store.promote(&grant, "s-1", "answer").unwrap();
        let entry = store
            .get("anyone", "s-1", ContextTier::Consensus, "answer")
            .unwrap();
        assert_eq!(entry.value, serde_json::json!("42"));

        // Consensus entries are write-once.
        let err = store.promote(&grant, "s-1", "answer").unwrap_err();
        assert!(matches!(err, CoordinationError::Forbidden(_)));
    }

    #[test]
    fn test_promote_missing_shared_entry() {
        let store = store();
        let grant = store.take_consensus_grant().unwrap();
        assert!(matches!(
            store.promote(&grant, "s-1", "ghost"),
            Err(CoordinationError::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_entry_reads_as_missing() {
        let store = store();
        store
            .put_with_expiry(
                "a-1",
                "s-1",
                ContextTier::Private,
                "ttl",
                serde_json::json!(1),
                Some(Utc::now() - Duration::seconds(1)),
            )
            .unwrap();

        assert!(matches!(
            store.get("a-1", "s-1", ContextTier::Private, "ttl"),
            Err(CoordinationError::NotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_covers_shared_and_consensus() {
        let store = store();
        let grant = store.take_consensus_grant().unwrap();
        store
            .put("a-1", "s-1", ContextTier::Shared, "s", serde_json::json!(1))
            .unwrap();
        store
            .put_consensus(&grant, "s-1", "c", serde_json::json!(2))
            .unwrap();
        store
            .put("a-1", "s-1", ContextTier::Private, "p", serde_json::json!(3))
            .unwrap();

        let snapshot = store.snapshot("s-1");
        assert_eq!(snapshot.shared.len(), 1);
        assert_eq!(snapshot.consensus.len(), 1);
        // Private entries never leak into snapshots.
        assert!(!snapshot.shared.contains_key("p"));
    }

    #[test]
    fn test_put_unknown_session() {
        let store = store();
        assert!(matches!(
            store.put(
                "a-1",
                "ghost",
                ContextTier::Shared,
                "k",
                serde_json::json!(1)
            ),
            Err(CoordinationError::InvalidSession(_))
        ));
    }
}
