use futures::future::BoxFuture;

use caseforge_core::types::{FinalReport, RunStatus, StageKind, StateRecord};

use super::test_generator::count_by_category;
use crate::stage::{RetryHint, Stage, StageOutput, StageResult, StageSuccess};

/// Builds the summary report. Runs on every record, failed or not.
pub struct Finalizer;

impl Stage for Finalizer {
    fn kind(&self) -> StageKind {
        StageKind::Finalizer
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        _hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move { Ok(StageSuccess::new(StageOutput::Report(build_report(state)))) })
    }
}

/// Summarize a record. A pure function of the record, so finalizing the same
/// terminal record twice yields the same report.
///
/// The Finalizer's own history entries are left out of `stage_history`.
pub fn build_report(state: &StateRecord) -> FinalReport {
    let status = if state.status == RunStatus::Failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    FinalReport {
        session_id: state.session_id().clone(),
        status,
        documents_received: state.input_documents().len(),
        documents_processed: state.parsed_documents.len(),
        requirements_extracted: state.requirements.len(),
        compliance_mappings: state.compliance_mappings.len(),
        test_cases_generated: state.test_cases.len(),
        test_cases_by_category: count_by_category(&state.test_cases),
        quality: state.quality_scores.clone(),
        stage_history: state
            .history
            .iter()
            .filter(|r| r.stage != StageKind::Finalizer)
            .cloned()
            .collect(),
        degraded_stages: state.degraded_stages.clone(),
        error_log: state.error_log.clone(),
    }
}
