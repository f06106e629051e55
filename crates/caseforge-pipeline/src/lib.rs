//! Requirement-to-test-case workflow.
//!
//! Six stages run in a fixed order over one `StateRecord`; a pure router
//! decides between advancing, retrying, degrading and aborting after each
//! stage, and the engine drives the loop until the record is terminal.

pub mod engine;
pub mod extract;
pub mod generator;
pub mod json;
pub mod prompts;
pub mod router;
pub mod run_log;
pub mod similarity;
pub mod stage;
pub mod stages;

pub use engine::WorkflowEngine;
pub use extract::DocumentExtractor;
pub use generator::TestCaseGenerator;
pub use router::{route, Outcome, Route};
pub use run_log::RunLogger;
pub use stage::{RetryHint, Stage, StageFailure, StageOutput, StageResult, StageSuccess};
