//! Public service surface: submit requests, watch sessions, fetch
//! results, cancel.
//!
//! Each submission runs on its own task; callers poll `get_result` or
//! subscribe to the session's events for progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::CoordinationConfig;
use crate::context::SharedContextStore;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{EventFilter, SessionId, SharedEventLog, Subscription};
use crate::orchestrator::{CollaborationRequest, OrchestrationController, SessionResult};
use crate::providers::AgentProvider;
use crate::registry::SharedAgentRegistry;

struct SessionHandle {
    cancel: CancellationToken,
    result: Arc<Mutex<Option<SessionResult>>>,
}

/// Front door for collaboration sessions.
pub struct CollaborationService {
    log: SharedEventLog,
    controller: Arc<OrchestrationController>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl CollaborationService {
    /// Wire a service over shared components. Fails if the context
    /// store's consensus grant was already taken.
    pub fn new(
        log: SharedEventLog,
        context: SharedContextStore,
        registry: SharedAgentRegistry,
        provider: Arc<dyn AgentProvider>,
        config: CoordinationConfig,
    ) -> CoordinationResult<Self> {
        let controller = Arc::new(OrchestrationController::new(
            log.clone(),
            context,
            registry,
            provider,
            config,
        )?);
        Ok(Self {
            log,
            controller,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a request, returning the new session id immediately. The
    /// session is open (subscribable) before this returns.
    pub fn submit(&self, request: CollaborationRequest) -> SessionId {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.log.open_session(&session_id);
        info!(session_id, description = %request.description, "Request submitted");

        let cancel = CancellationToken::new();
        let slot: Arc<Mutex<Option<SessionResult>>> = Arc::new(Mutex::new(None));

        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(
                session_id.clone(),
                SessionHandle {
                    cancel: cancel.clone(),
                    result: slot.clone(),
                },
            );

        let controller = self.controller.clone();
        let run_session = session_id.clone();
        tokio::spawn(async move {
            match controller.run(&run_session, request, &cancel).await {
                Ok(result) => {
                    *slot.lock().expect("session result lock poisoned") = Some(result);
                }
                Err(e) => {
                    error!(session_id = %run_session, "Session failed: {e}");
                }
            }
        });

        session_id
    }

    /// Subscribe to a session's events as they are appended.
    pub fn subscribe(
        &self,
        session_id: &str,
        filter: EventFilter,
    ) -> CoordinationResult<Subscription> {
        self.log.subscribe(session_id, filter)
    }

    /// The session's result, once it has finished.
    pub fn get_result(&self, session_id: &str) -> Option<SessionResult> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let handle = sessions.get(session_id)?;
        let result = handle
            .result
            .lock()
            .expect("session result lock poisoned")
            .clone();
        result
    }

    /// Request cancellation of a running session. Idempotent; the
    /// session winds down at its next phase boundary.
    pub fn cancel(&self, session_id: &str) -> CoordinationResult<()> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| CoordinationError::InvalidSession(session_id.to_string()))?;
        handle.cancel.cancel();
        info!(session_id, "Cancellation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStore;
    use crate::events::EventLog;
    use crate::providers::{Generation, ProviderError};
    use crate::registry::{AgentProfile, AgentRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoProvider;

    #[async_trait]
    impl AgentProvider for EchoProvider {
        async fn generate(
            &self,
            _agent_role: &str,
            prompt: &str,
            _context: &crate::context::ContextSnapshot,
        ) -> Result<Generation, ProviderError> {
            Ok(Generation {
                text: format!("answer to {prompt}"),
                confidence: 0.85,
            })
        }
    }

    fn service() -> CollaborationService {
        let log = EventLog::new().shared();
        let context = ContextStore::new(log.clone()).shared();
        let registry = AgentRegistry::new();
        registry.register(AgentProfile::new("a-1", ["analysis".to_string()]));
        CollaborationService::new(
            log,
            context,
            registry.shared(),
            Arc::new(EchoProvider),
            CoordinationConfig::default().with_fast_windows(),
        )
        .unwrap()
    }

    async fn wait_for_result(
        service: &CollaborationService,
        session_id: &str,
    ) -> SessionResult {
        for _ in 0..100 {
            if let Some(result) = service.get_result(session_id) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session {session_id} did not finish");
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let service = service();
        let session_id = service.submit(CollaborationRequest::new("summarize the incident"));

        // Subscribable immediately.
        assert!(service.subscribe(&session_id, EventFilter::new()).is_ok());

        let result = wait_for_result(&service, &session_id).await;
        assert_eq!(result.session_id, session_id);
        assert!(result.final_content.is_some());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let service = service();
        let first = service.submit(CollaborationRequest::new("first question"));
        let second = service.submit(CollaborationRequest::new("second question"));
        assert_ne!(first, second);

        let result = wait_for_result(&service, &first).await;
        assert_eq!(result.session_id, first);
    }

    #[tokio::test]
    async fn test_get_result_unknown_session() {
        let service = service();
        assert!(service.get_result("ghost").is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let service = service();
        assert!(matches!(
            service.cancel("ghost"),
            Err(CoordinationError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_yields_partial_result() {
        let service = service();
        let session_id = service.submit(CollaborationRequest::new("slow question"));
        service.cancel(&session_id).unwrap();

        let result = wait_for_result(&service, &session_id).await;
        // Either it finished before the cancel landed or it was cut short
        // with the cancellation recorded.
        if result.quality.is_none() {
            assert!(result.issues.iter().any(|i| i == "cancelled"));
        }
    }
}
