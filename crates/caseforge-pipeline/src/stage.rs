use std::collections::BTreeMap;
use std::fmt;

use futures::future::BoxFuture;

use caseforge_core::error::CaseforgeError;
use caseforge_core::types::{
    ComplianceMappings, FinalReport, ParsedDocument, QualityScores, Requirement, StageKind,
    StateRecord, TestCase,
};

/// The fields a stage is allowed to write, one variant per stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Parsed(Vec<ParsedDocument>),
    Requirements(Vec<Requirement>),
    Mappings {
        mappings: ComplianceMappings,
        rationale: BTreeMap<String, String>,
    },
    TestCases(Vec<TestCase>),
    Quality(QualityScores),
    Report(FinalReport),
    /// Degraded continuation with nothing to write.
    Nothing,
}

/// Successful stage result: its output plus non-fatal notes for the error log.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess {
    pub output: StageOutput,
    pub notes: Vec<String>,
}

impl StageSuccess {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// Stage failure, carrying the offending model output when there was one.
///
/// Stages that fan out to several model calls report each failed call's
/// output under that call's key in `call_outputs` instead of `raw_output`.
#[derive(Debug)]
pub struct StageFailure {
    pub error: CaseforgeError,
    pub raw_output: Option<String>,
    pub call_outputs: BTreeMap<String, String>,
}

impl StageFailure {
    pub fn new(error: CaseforgeError) -> Self {
        Self {
            error,
            raw_output: None,
            call_outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(error: CaseforgeError, raw_output: impl Into<String>) -> Self {
        Self {
            raw_output: Some(raw_output.into()),
            ..Self::new(error)
        }
    }

    pub fn with_call_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.raw_output = None;
        self.call_outputs = outputs;
        self
    }
}

impl From<CaseforgeError> for StageFailure {
    fn from(error: CaseforgeError) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

pub type StageResult = std::result::Result<StageSuccess, StageFailure>;

/// Context for a re-invocation after a failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryHint {
    /// 1-based retry number.
    pub attempt: u32,
    pub previous_output: Option<String>,
    /// Previous outputs of the individual calls that failed, by call key.
    pub previous_outputs: BTreeMap<String, String>,
    pub issue: String,
}

impl RetryHint {
    pub fn from_failure(attempt: u32, failure: StageFailure) -> Self {
        Self {
            attempt,
            issue: failure.error.to_string(),
            previous_output: failure.raw_output,
            previous_outputs: failure.call_outputs,
        }
    }

    /// Whether the call under `key` needs reformat instructions.
    ///
    /// Calls of a fan-out stage that answered usably the first time are
    /// retried with their plain prompt.
    pub fn concerns(&self, key: &str) -> bool {
        self.previous_outputs.is_empty() || self.previous_outputs.contains_key(key)
    }
}

/// One workflow node.
///
/// Stages read the record and return what they produced; the engine is the
/// only writer of the record.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult>;

    /// Fallback output once retries are exhausted. Only consulted for
    /// non-critical stages.
    fn degrade(&self, _state: &StateRecord) -> Option<StageSuccess> {
        None
    }
}
