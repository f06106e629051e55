use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use caseforge_core::config::AppConfig;
use caseforge_core::error::CaseforgeError;
use caseforge_core::event::{EventBus, WorkflowEvent};
use caseforge_core::traits::{DocumentTextExtractor, ModelClient, SessionStore};
use caseforge_core::types::{
    RunStatus, StageKind, StageOutcomeKind, StageRecord, StateRecord,
};

use crate::router::{missing_input, route, Outcome, Route};
use crate::stage::{RetryHint, Stage, StageFailure, StageOutput, StageSuccess};
use crate::stages::{
    ComplianceMapper, DocumentParser, Finalizer, QualityValidator, RequirementExtractor,
    TestGenerator,
};

/// Drives one State Record through the stages.
///
/// Starting from `state.current_stage` (or the DocumentParser), the engine
/// runs a stage, writes its output into the record, asks the router where to
/// go next, and checkpoints. The Finalizer always runs before the loop exits.
pub struct WorkflowEngine {
    stages: HashMap<StageKind, Box<dyn Stage>>,
    store: Option<Arc<dyn SessionStore>>,
    events: Arc<EventBus>,
    max_retries: u32,
    checkpoint_each_stage: bool,
}

impl WorkflowEngine {
    /// Wire the standard six stages from configuration.
    pub fn from_config(
        config: &AppConfig,
        model: Arc<dyn ModelClient>,
        extractor: Arc<dyn DocumentTextExtractor>,
    ) -> Self {
        let timeout = Duration::from_secs(config.model.timeout_secs);
        let workflow = &config.workflow;
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(DocumentParser::new(extractor)),
            Box::new(RequirementExtractor::new(
                Arc::clone(&model),
                timeout,
                workflow.max_input_chars,
                workflow.max_concurrent_documents,
            )),
            Box::new(ComplianceMapper::new(Arc::clone(&model), timeout)),
            Box::new(TestGenerator::new(
                model,
                timeout,
                config.generation.clone(),
                workflow.max_concurrent_documents,
            )),
            Box::new(QualityValidator::new(config.quality.clone())),
            Box::new(Finalizer),
        ];
        Self::with_stages(stages, workflow.max_retries, workflow.checkpoint_each_stage)
    }

    pub fn with_stages(
        stages: Vec<Box<dyn Stage>>,
        max_retries: u32,
        checkpoint_each_stage: bool,
    ) -> Self {
        Self {
            stages: stages.into_iter().map(|s| (s.kind(), s)).collect(),
            store: None,
            events: Arc::new(EventBus::default()),
            max_retries,
            checkpoint_each_stage,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run until the record is terminal and finalized.
    ///
    /// Terminal records that already carry a report are returned unchanged; a
    /// terminal record without one only gets the Finalizer.
    pub async fn run(&self, mut state: StateRecord, cancel: &CancellationToken) -> StateRecord {
        if state.is_terminal() && state.report.is_some() {
            return state;
        }

        let session_id = state.session_id().clone();
        let mut stage = if state.is_terminal() {
            StageKind::Finalizer
        } else {
            state.advance_status(RunStatus::Running);
            state.current_stage.unwrap_or(StageKind::DocumentParser)
        };
        let mut hint: Option<RetryHint> = None;

        info!(
            session_id = %session_id,
            stage = %stage,
            documents = state.input_documents().len(),
            "Workflow started"
        );
        self.events.publish(WorkflowEvent::RunStarted {
            session_id: session_id.clone(),
            documents: state.input_documents().len(),
        });

        loop {
            state.current_stage = Some(stage);

            if stage != StageKind::Finalizer && cancel.is_cancelled() {
                warn!(session_id = %session_id, stage = %stage, "Run cancelled, finalizing");
                state.log_error(Some(stage), &CaseforgeError::Cancelled);
                state.advance_status(RunStatus::Failed);
                stage = StageKind::Finalizer;
                hint = None;
                continue;
            }

            let outcome = match missing_input(stage, &state) {
                Some(err) => {
                    warn!(session_id = %session_id, stage = %stage, error = %err, "Stage input missing");
                    state.log_error(Some(stage), &err);
                    self.mark_stage_failed(&mut state);
                    Outcome::MissingInput
                }
                None => {
                    let (outcome, failure) = self.execute(&mut state, stage, hint.take()).await;
                    if let Some(failure) = failure {
                        hint = Some(RetryHint::from_failure(state.retries(stage) + 1, failure));
                    }
                    outcome
                }
            };

            let retries_used = state.retries(stage);
            match route(stage, outcome, retries_used, self.max_retries) {
                Route::Next(next) => {
                    hint = None;
                    stage = next;
                }
                Route::Retry => {
                    let count = state.bump_retry(stage);
                    state.advance_status(RunStatus::Retrying);
                    info!(
                        session_id = %session_id,
                        stage = %stage,
                        retry = count,
                        max_retries = self.max_retries,
                        "Retrying stage"
                    );
                }
                Route::Degrade(next) => {
                    self.degrade(&mut state, stage);
                    hint = None;
                    stage = next;
                }
                Route::Abort => {
                    hint = None;
                    if !state.is_terminal() {
                        state.advance_status(RunStatus::Failed);
                    }
                    if stage == StageKind::Finalizer {
                        break;
                    }
                    error!(session_id = %session_id, stage = %stage, "Critical stage failed, finalizing run as failed");
                    stage = StageKind::Finalizer;
                }
                Route::Complete => {
                    if !state.is_terminal() {
                        state.advance_status(RunStatus::Completed);
                    }
                    break;
                }
            }

            state.current_stage = Some(stage);
            if self.checkpoint_each_stage {
                self.checkpoint(&state).await;
            }
        }

        state.current_stage = None;
        state.touch();
        info!(
            session_id = %session_id,
            status = %state.status,
            requirements = state.requirements.len(),
            test_cases = state.test_cases.len(),
            "Workflow finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            session_id,
            status: state.status,
        });
        state
    }

    /// Run one stage attempt and fold its result into the record.
    async fn execute(
        &self,
        state: &mut StateRecord,
        stage: StageKind,
        hint: Option<RetryHint>,
    ) -> (Outcome, Option<StageFailure>) {
        let session_id = state.session_id().clone();
        let attempt = state.retries(stage) + 1;
        debug!(session_id = %session_id, stage = %stage, attempt, "Executing stage");
        self.events.publish(WorkflowEvent::StageStarted {
            session_id: session_id.clone(),
            stage,
            attempt,
        });

        let started = Instant::now();
        let result = match self.stages.get(&stage) {
            Some(runner) => runner.run(state, hint.as_ref()).await,
            None => Err(StageFailure::new(CaseforgeError::Config(format!(
                "no stage registered for {}",
                stage
            )))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(success) => {
                apply(state, stage, success);
                state.history.push(StageRecord {
                    stage,
                    attempt,
                    outcome: StageOutcomeKind::Succeeded,
                    duration_ms,
                });
                if !state.is_terminal() {
                    state.advance_status(RunStatus::Running);
                }
                self.events.publish(WorkflowEvent::StageSucceeded {
                    session_id,
                    stage,
                    attempt,
                    duration_ms,
                });
                (Outcome::Success, None)
            }
            Err(failure) => {
                let fatal = failure.error.is_fatal();
                error!(
                    session_id = %session_id,
                    stage = %stage,
                    attempt,
                    fatal,
                    error = %failure.error,
                    "Stage failed"
                );
                state.log_error(Some(stage), &failure.error);
                state.history.push(StageRecord {
                    stage,
                    attempt,
                    outcome: StageOutcomeKind::Failed,
                    duration_ms,
                });
                self.mark_stage_failed(state);
                self.events.publish(WorkflowEvent::StageFailed {
                    session_id,
                    stage,
                    attempt,
                    error: failure.error.to_string(),
                    fatal,
                });
                (Outcome::from_error(&failure.error), Some(failure))
            }
        }
    }

    fn mark_stage_failed(&self, state: &mut StateRecord) {
        if !state.is_terminal() {
            state.advance_status(RunStatus::StageFailed);
        }
    }

    /// Record a non-critical stage as degraded, applying its fallback output if it has one.
    fn degrade(&self, state: &mut StateRecord, stage: StageKind) {
        warn!(session_id = %state.session_id(), stage = %stage, "Retries exhausted, continuing degraded");
        let fallback = self.stages.get(&stage).and_then(|s| s.degrade(state));
        let applied = fallback.is_some();
        if let Some(success) = fallback {
            apply(state, stage, success);
        }
        state.degraded_stages.push(stage);
        state.history.push(StageRecord {
            stage,
            attempt: state.retries(stage) + 1,
            outcome: StageOutcomeKind::Degraded,
            duration_ms: 0,
        });
        if !applied {
            state.log_note(Some(stage), format!("{} skipped after exhausting retries", stage));
        }
        state.advance_status(RunStatus::Running);
        self.events.publish(WorkflowEvent::StageDegraded {
            session_id: state.session_id().clone(),
            stage,
        });
    }

    async fn checkpoint(&self, state: &StateRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(state).await {
            warn!(session_id = %state.session_id(), error = %e, "Checkpoint failed");
        }
    }
}

/// Write a stage's output into the record. Only the stage's own field changes.
fn apply(state: &mut StateRecord, stage: StageKind, success: StageSuccess) {
    for note in success.notes {
        state.log_note(Some(stage), note);
    }
    match success.output {
        StageOutput::Parsed(docs) => state.parsed_documents = docs,
        StageOutput::Requirements(reqs) => state.requirements = reqs,
        StageOutput::Mappings {
            mappings,
            rationale,
        } => {
            state.compliance_mappings = mappings;
            state.mapping_rationale = rationale;
        }
        StageOutput::TestCases(cases) => state.test_cases = cases,
        StageOutput::Quality(scores) => state.quality_scores = Some(scores),
        StageOutput::Report(report) => state.report = Some(report),
        StageOutput::Nothing => {}
    }
    state.touch();
}
