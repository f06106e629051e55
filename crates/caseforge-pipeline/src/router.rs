//! The workflow transition table.
//!
//! `route` is a pure function from (stage, outcome, retries used) to the next
//! step. The engine owns all side effects.

use caseforge_core::error::CaseforgeError;
use caseforge_core::types::{StageKind, StateRecord};

/// How a stage invocation ended, as far as routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The stage ran and failed. Fatal failures skip retry.
    Failure { fatal: bool },
    /// The stage could not run because its input is missing.
    MissingInput,
}

impl Outcome {
    pub fn from_error(error: &CaseforgeError) -> Self {
        Self::Failure {
            fatal: error.is_fatal(),
        }
    }
}

/// Next step chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Continue with the given stage.
    Next(StageKind),
    /// Re-invoke the same stage.
    Retry,
    /// Non-critical stage gave up; continue with the given stage in degraded mode.
    Degrade(StageKind),
    /// Critical stage gave up; jump to the Finalizer with status failed.
    Abort,
    /// The Finalizer succeeded; the run is complete.
    Complete,
}

/// Evaluate the transition table.
pub fn route(stage: StageKind, outcome: Outcome, retries_used: u32, max_retries: u32) -> Route {
    match outcome {
        Outcome::Success => match stage.next() {
            Some(next) => Route::Next(next),
            None => Route::Complete,
        },
        Outcome::MissingInput => Route::Abort,
        Outcome::Failure { fatal } => {
            if !fatal && retries_used < max_retries {
                return Route::Retry;
            }
            if stage.is_critical() {
                return Route::Abort;
            }
            match stage.next() {
                Some(next) => Route::Degrade(next),
                // Nothing left to degrade into
                None => Route::Abort,
            }
        }
    }
}

/// Input check run before a stage is scheduled. Returns the error to record
/// when the stage's required input is absent.
pub fn missing_input(stage: StageKind, state: &StateRecord) -> Option<CaseforgeError> {
    match stage {
        StageKind::RequirementExtractor if state.parsed_documents.is_empty() => Some(
            CaseforgeError::Extraction("no parsed documents to extract from".into()),
        ),
        StageKind::ComplianceMapper if state.requirements.is_empty() => Some(
            CaseforgeError::Mapping("no requirements to map".into()),
        ),
        StageKind::TestGenerator if state.requirements.is_empty() => Some(
            CaseforgeError::Generation("no requirements to generate test cases for".into()),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageKind::*;

    const MAX: u32 = 3;

    #[test]
    fn test_success_advances_in_order() {
        assert_eq!(
            route(DocumentParser, Outcome::Success, 0, MAX),
            Route::Next(RequirementExtractor)
        );
        assert_eq!(
            route(QualityValidator, Outcome::Success, 2, MAX),
            Route::Next(Finalizer)
        );
        assert_eq!(route(Finalizer, Outcome::Success, 0, MAX), Route::Complete);
    }

    #[test]
    fn test_transient_failure_retries_until_bound() {
        let transient = Outcome::Failure { fatal: false };
        for used in 0..MAX {
            assert_eq!(route(RequirementExtractor, transient, used, MAX), Route::Retry);
        }
        assert_eq!(route(RequirementExtractor, transient, MAX, MAX), Route::Abort);
    }

    #[test]
    fn test_degrade_vs_abort() {
        let transient = Outcome::Failure { fatal: false };
        assert_eq!(
            route(ComplianceMapper, transient, MAX, MAX),
            Route::Degrade(TestGenerator)
        );
        assert_eq!(
            route(QualityValidator, transient, MAX, MAX),
            Route::Degrade(Finalizer)
        );
        assert_eq!(route(DocumentParser, transient, MAX, MAX), Route::Abort);
        assert_eq!(route(TestGenerator, transient, MAX, MAX), Route::Abort);
    }

    #[test]
    fn test_fatal_skips_retry() {
        let fatal = Outcome::Failure { fatal: true };
        assert_eq!(route(RequirementExtractor, fatal, 0, MAX), Route::Abort);
        assert_eq!(route(ComplianceMapper, fatal, 0, MAX), Route::Degrade(TestGenerator));
    }

    #[test]
    fn test_zero_retry_budget() {
        let transient = Outcome::Failure { fatal: false };
        assert_eq!(route(TestGenerator, transient, 0, 0), Route::Abort);
    }

    #[test]
    fn test_missing_input_aborts() {
        assert_eq!(route(ComplianceMapper, Outcome::MissingInput, 0, MAX), Route::Abort);

        let state = StateRecord::new(vec![], []);
        assert!(missing_input(ComplianceMapper, &state).is_some());
        assert!(missing_input(TestGenerator, &state).is_some());
        assert!(missing_input(QualityValidator, &state).is_none());
        assert!(missing_input(Finalizer, &state).is_none());
    }

    #[test]
    fn test_finalizer_failure_terminates() {
        assert_eq!(
            route(Finalizer, Outcome::Failure { fatal: false }, MAX, MAX),
            Route::Abort
        );
    }
}
