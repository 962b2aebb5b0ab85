//! Append-only session event log — the blackboard.
//!
//! The log is the single serialization point for a session: sequence
//! numbers and Lamport stamps are assigned under one per-log mutex, and
//! all inter-agent communication flows through appends and subscriptions.
//! Broadcast delivery is at-least-once; consumers dedupe on event id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{CoordinationError, CoordinationResult};

use super::types::{AppendReceipt, Event, EventDraft, EventType, Performative, SessionId};

/// Broadcast channel capacity per session.
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to the event log.
pub type SharedEventLog = Arc<EventLog>;

/// Per-session storage and ordering state.
struct SessionLog {
    events: Vec<Event>,
    lamport: u64,
    sender: broadcast::Sender<Event>,
}

impl SessionLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events: Vec::new(),
            lamport: 0,
            sender,
        }
    }
}

/// Append-only, per-session ordered event store.
pub struct EventLog {
    sessions: Mutex<HashMap<SessionId, SessionLog>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a shared reference to this log.
    pub fn shared(self) -> SharedEventLog {
        Arc::new(self)
    }

    /// Register a session. Returns false if the session already existed.
    pub fn open_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("event log lock poisoned");
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(session_id.to_string(), SessionLog::new());
        debug!(session_id, "Session opened");
        true
    }

    /// Whether a session is registered.
    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .expect("event log lock poisoned")
            .contains_key(session_id)
    }

    /// Append an event, assigning its sequence number and Lamport stamp
    /// atomically. Fails with `InvalidSession` for unknown sessions.
    pub fn append(&self, draft: EventDraft) -> CoordinationResult<AppendReceipt> {
        let event = {
            let mut sessions = self.sessions.lock().expect("event log lock poisoned");
            let session = sessions
                .get_mut(&draft.session_id)
                .ok_or_else(|| CoordinationError::InvalidSession(draft.session_id.clone()))?;

            let observed = draft.observed_timestamp.unwrap_or(0);
            session.lamport = session.lamport.max(observed) + 1;
            let sequence_number = session.events.len() as u64 + 1;

            let event = Event {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: draft.session_id,
                sequence_number,
                logical_timestamp: session.lamport,
                event_type: draft.event_type,
                performative: draft.performative,
                source_agent_id: draft.source_agent_id,
                parent_event_id: draft.parent_event_id,
                payload: draft.payload,
                recorded_at: Utc::now(),
            };
            session.events.push(event.clone());

            // Broadcast inside the critical section so subscribers observe
            // appends in sequence order; send never blocks.
            if session.sender.send(event.clone()).is_err() {
                debug!(
                    event_type = %event.event_type,
                    "Event appended (no subscribers)"
                );
            }
            event
        };

        debug!(
            session_id = %event.session_id,
            event_type = %event.event_type,
            seq = event.sequence_number,
            lamport = event.logical_timestamp,
            "Event appended"
        );

        Ok(AppendReceipt {
            event_id: event.id,
            sequence_number: event.sequence_number,
            logical_timestamp: event.logical_timestamp,
        })
    }

    /// Query events in ascending sequence order, starting after
    /// `from_sequence` (pass 0 for the full log). Restartable: callers
    /// resume by passing the last sequence number they saw.
    pub fn query(
        &self,
        session_id: &str,
        filter: &EventFilter,
        from_sequence: u64,
    ) -> CoordinationResult<Vec<Event>> {
        let sessions = self.sessions.lock().expect("event log lock poisoned");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CoordinationError::InvalidSession(session_id.to_string()))?;

        Ok(session
            .events
            .iter()
            .filter(|e| e.sequence_number > from_sequence && filter.matches(e))
            .cloned()
            .collect())
    }

    /// Number of events appended to a session.
    pub fn event_count(&self, session_id: &str) -> CoordinationResult<u64> {
        let sessions = self.sessions.lock().expect("event log lock poisoned");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CoordinationError::InvalidSession(session_id.to_string()))?;
        Ok(session.events.len() as u64)
    }

    /// Current Lamport counter for a session.
    pub fn logical_time(&self, session_id: &str) -> CoordinationResult<u64> {
        let sessions = self.sessions.lock().expect("event log lock poisoned");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CoordinationError::InvalidSession(session_id.to_string()))?;
        Ok(session.lamport)
    }

    /// Subscribe to a session's events as they are appended.
    ///
    /// Delivery is at-least-once: a lagged receiver skips ahead and the
    /// caller is expected to backfill via `query` and dedupe on event id.
    pub fn subscribe(
        &self,
        session_id: &str,
        filter: EventFilter,
    ) -> CoordinationResult<Subscription> {
        let sessions = self.sessions.lock().expect("event log lock poisoned");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CoordinationError::InvalidSession(session_id.to_string()))?;
        Ok(Subscription {
            receiver: session.sender.subscribe(),
            filter,
        })
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter for selective queries and subscriptions.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Match only these event types.
    pub event_types: Option<Vec<EventType>>,
    /// Match only this performative.
    pub performative: Option<Performative>,
    /// Match only events from this agent.
    pub source_agent_id: Option<String>,
}

impl EventFilter {
    /// Create an empty filter (matches all events).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event types.
    pub fn types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filter by performative.
    pub fn performative(mut self, performative: Performative) -> Self {
        self.performative = Some(performative);
        self
    }

    /// Filter by source agent.
    pub fn source(mut self, agent_id: &str) -> Self {
        self.source_agent_id = Some(agent_id.to_string());
        self
    }

    /// Check whether an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(performative) = self.performative {
            if event.performative != performative {
                return false;
            }
        }
        if let Some(ref source) = self.source_agent_id {
            if &event.source_agent_id != source {
                return false;
            }
        }
        true
    }
}

/// A filtered, at-least-once subscription to one session's events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Receive the next matching event.
    ///
    /// A lagged receiver logs and continues; `None` means the session's
    /// channel closed (session dropped).
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscription lagged; consumer should backfill via query");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
