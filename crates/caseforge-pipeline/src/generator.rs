use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use caseforge_core::config::{AppConfig, OverflowPolicy};
use caseforge_core::error::{CaseforgeError, Result};
use caseforge_core::event::EventBus;
use caseforge_core::traits::{ModelClient, SessionStore};
use caseforge_core::types::{
    ComplianceStandard, InputDocument, ProcessingResult, SessionId, SessionSummary, StateRecord,
};

use crate::engine::WorkflowEngine;
use crate::extract::DocumentExtractor;
use crate::run_log::RunLogger;

/// How long a finished run waits for its log writer to drain.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Entry point for callers: documents in, processing result out.
///
/// Bounds the number of concurrent runs, persists the terminal record, and
/// exposes the session operations (resume, status, list, cleanup).
pub struct TestCaseGenerator {
    config: AppConfig,
    engine: WorkflowEngine,
    store: Option<Arc<dyn SessionStore>>,
    slots: Arc<Semaphore>,
}

impl TestCaseGenerator {
    /// Standard stages over `model`, with the multi-format document extractor.
    pub fn new(config: AppConfig, model: Arc<dyn ModelClient>) -> Self {
        let engine =
            WorkflowEngine::from_config(&config, model, Arc::new(DocumentExtractor::new()));
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: AppConfig, engine: WorkflowEngine) -> Self {
        let slots = Arc::new(Semaphore::new(config.workflow.max_concurrent_sessions));
        Self {
            config,
            engine,
            store: None,
            slots,
        }
    }

    /// Persist records to `store`: checkpoints during the run and the terminal save.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.engine = self.engine.with_store(Arc::clone(&store));
        self.store = Some(store);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.engine.events()
    }

    /// Run a fresh session to completion.
    ///
    /// An empty `compliance_standards` falls back to the configured defaults.
    pub async fn process_documents(
        &self,
        documents: Vec<InputDocument>,
        compliance_standards: impl IntoIterator<Item = ComplianceStandard>,
    ) -> Result<ProcessingResult> {
        self.process_documents_with_cancel(
            documents,
            compliance_standards,
            &CancellationToken::new(),
        )
        .await
    }

    /// As `process_documents`, but stops between stages once `cancel` fires.
    pub async fn process_documents_with_cancel(
        &self,
        documents: Vec<InputDocument>,
        compliance_standards: impl IntoIterator<Item = ComplianceStandard>,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        let mut standards: Vec<ComplianceStandard> = compliance_standards.into_iter().collect();
        if standards.is_empty() {
            standards = self.config.compliance.default_standards.clone();
        }
        let state = StateRecord::new(documents, standards);
        self.drive(state, cancel).await
    }

    /// Continue a stored session from the stage it stopped at.
    ///
    /// Terminal sessions are returned as stored.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        let state = self.store()?.load(session_id).await?;
        if state.is_terminal() && state.report.is_some() {
            info!(session_id = %session_id, status = %state.status, "Session already finished");
            return Ok(ProcessingResult::from(state));
        }
        info!(
            session_id = %session_id,
            stage = ?state.current_stage,
            "Resuming session"
        );
        self.drive(state, cancel).await
    }

    pub async fn session_status(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let state = self.store()?.load(session_id).await?;
        Ok(SessionSummary::from(&state))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.store()?.list().await
    }

    /// Remove a stored session. Returns whether it existed.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let deleted = self.store()?.delete(session_id).await?;
        if deleted {
            info!(session_id = %session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Evict sessions idle for longer than `session.timeout_minutes`.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let timeout = i64::try_from(self.config.session.timeout_minutes).unwrap_or(i64::MAX);
        let cutoff = chrono::Duration::try_minutes(timeout)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = store.cleanup_expired(cutoff).await?;
        info!(removed, "Expired sessions cleaned up");
        Ok(removed)
    }

    fn store(&self) -> Result<&Arc<dyn SessionStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| CaseforgeError::Persistence("session persistence is disabled".into()))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        let limit = self.config.workflow.max_concurrent_sessions;
        match self.config.workflow.overflow {
            OverflowPolicy::Queue => Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| CaseforgeError::Busy(limit)),
            OverflowPolicy::Reject => Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
                warn!(limit, "Session limit reached, rejecting run");
                CaseforgeError::Busy(limit)
            }),
        }
    }

    async fn drive(&self, state: StateRecord, cancel: &CancellationToken) -> Result<ProcessingResult> {
        let _permit = self.acquire_slot().await?;
        let session_id = state.session_id().clone();

        let logger = self.config.log_dir().map(|dir| {
            RunLogger::new(dir).spawn(self.engine.events(), session_id.clone(), cancel.child_token())
        });

        let state = self.engine.run(state, cancel).await;

        if let Some(handle) = logger {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(session_id = %session_id, "Run log writer did not finish in time");
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&state).await {
                error!(session_id = %session_id, error = %e, "Failed to save finished session");
                return Err(e);
            }
        }

        Ok(ProcessingResult::from(state))
    }
}
