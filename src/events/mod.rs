//! Session blackboard: append-only event log with causal ordering.

pub mod log;
pub mod types;

pub use log::{EventFilter, EventLog, SharedEventLog, Subscription};
pub use types::{
    AgentId, AppendReceipt, Event, EventDraft, EventId, EventType, Performative, SessionId,
};
