use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CaseforgeError;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Documents ────────────────────────────────────────────────────

/// A caller-supplied document: file name plus raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDocument {
    pub filename: String,
    pub content: Vec<u8>,
}

impl InputDocument {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    pub fn from_text(filename: impl Into<String>, text: &str) -> Self {
        Self::new(filename, text.as_bytes().to_vec())
    }
}

/// Document format detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Xml,
    Pdf,
    Docx,
    Xlsx,
    Unknown,
}

impl DocumentFormat {
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "text" => Self::Text,
            "md" | "markdown" => Self::Markdown,
            "xml" => Self::Xml,
            "pdf" => Self::Pdf,
            "docx" | "doc" => Self::Docx,
            "xlsx" | "xls" => Self::Xlsx,
            _ => Self::Unknown,
        }
    }
}

/// Text recovered from one input document, plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub filename: String,
    pub format: DocumentFormat,
    pub size_bytes: usize,
    pub word_count: usize,
    pub text: String,
}

// ── Compliance ───────────────────────────────────────────────────

/// Healthcare regulatory standards a requirement can be tagged with.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStandard {
    Fda,
    Hipaa,
    #[serde(rename = "iec_62304")]
    Iec62304,
    #[serde(rename = "iso_27001")]
    Iso27001,
    #[serde(rename = "iso_13485")]
    Iso13485,
    #[serde(rename = "iso_9001")]
    Iso9001,
    Gdpr,
}

impl ComplianceStandard {
    pub const ALL: [ComplianceStandard; 7] = [
        Self::Fda,
        Self::Hipaa,
        Self::Iec62304,
        Self::Iso27001,
        Self::Iso13485,
        Self::Iso9001,
        Self::Gdpr,
    ];

    /// Parse a tag as models tend to spell it ("IEC 62304", "iec_62304", "ISO-27001").
    pub fn parse(tag: &str) -> Option<Self> {
        let norm: String = tag
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "fda" | "fda21cfr" | "21cfr" | "21cfrpart11" | "21cfrpart820" => Some(Self::Fda),
            "hipaa" => Some(Self::Hipaa),
            "iec62304" => Some(Self::Iec62304),
            "iso27001" => Some(Self::Iso27001),
            "iso13485" => Some(Self::Iso13485),
            "iso9001" => Some(Self::Iso9001),
            "gdpr" => Some(Self::Gdpr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fda => "fda",
            Self::Hipaa => "hipaa",
            Self::Iec62304 => "iec_62304",
            Self::Iso27001 => "iso_27001",
            Self::Iso13485 => "iso_13485",
            Self::Iso9001 => "iso_9001",
            Self::Gdpr => "gdpr",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Fda => "FDA - Medical device regulations (21 CFR Part 820, Part 11)",
            Self::Hipaa => "HIPAA - Health Insurance Portability and Accountability Act",
            Self::Iec62304 => "IEC 62304 - Medical device software lifecycle processes",
            Self::Iso27001 => "ISO 27001 - Information security management",
            Self::Iso13485 => "ISO 13485 - Medical devices quality management systems",
            Self::Iso9001 => "ISO 9001 - Quality management systems",
            Self::Gdpr => "GDPR - General Data Protection Regulation",
        }
    }

    /// Keywords that indicate a requirement falls under this standard.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Fda => &["medical device", "fda", "regulation", "safety", "effectiveness"],
            Self::Hipaa => &["patient", "health", "privacy", "phi", "medical record", "encrypt"],
            Self::Iec62304 => &["software", "medical device", "lifecycle", "development"],
            Self::Iso27001 => &["security", "information", "access control", "encrypt", "risk"],
            Self::Iso13485 => &["quality", "medical device", "design control"],
            Self::Iso9001 => &["quality", "process", "management"],
            Self::Gdpr => &["personal data", "privacy", "consent", "data protection", "erasure"],
        }
    }
}

impl std::fmt::Display for ComplianceStandard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Requirements & test cases ────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    #[default]
    Functional,
    NonFunctional,
    Performance,
    Security,
    Compliance,
    Usability,
}

impl RequirementType {
    /// Lenient parse; unknown strings become `Functional`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "non_functional" | "nonfunctional" => Self::NonFunctional,
            "performance" => Self::Performance,
            "security" => Self::Security,
            "compliance" => Self::Compliance,
            "usability" => Self::Usability,
            _ => Self::Functional,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Lenient parse; unknown strings become `Medium`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// A requirement extracted from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub requirement_type: RequirementType,
    #[serde(default)]
    pub priority: Priority,
    /// File name of the document this requirement came from.
    pub source_document: String,
    #[serde(default)]
    pub source_section: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Test-case category.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Positive,
    Negative,
    Boundary,
    Security,
}

impl TestCategory {
    pub const ALL: [TestCategory; 4] = [
        Self::Positive,
        Self::Negative,
        Self::Boundary,
        Self::Security,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" | "functional" | "happy_path" => Some(Self::Positive),
            "negative" | "error" => Some(Self::Negative),
            "boundary" | "edge" | "edge_case" => Some(Self::Boundary),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    /// Short code used in generated test-case ids.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Positive => "POS",
            Self::Negative => "NEG",
            Self::Boundary => "BND",
            Self::Security => "SEC",
        }
    }
}

impl std::fmt::Display for TestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Boundary => "boundary",
            Self::Security => "security",
        };
        f.write_str(s)
    }
}

/// A generated test case, traced to exactly one requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub requirement_id: String,
    pub category: TestCategory,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub preconditions: Vec<String>,
    pub steps: Vec<String>,
    pub expected_result: String,
    #[serde(default)]
    pub compliance_standards: Vec<ComplianceStandard>,
}

/// Requirement id → compliance tags.
pub type ComplianceMappings = BTreeMap<String, BTreeSet<ComplianceStandard>>;

/// Quality scores computed over requirements and test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    /// Fraction of requirements with at least one test case, in [0,1].
    pub completeness: f64,
    /// Mean field completeness of test cases, in [0,1].
    pub accuracy: f64,
    /// Fraction of test cases with a resolvable requirement reference, in [0,1].
    pub traceability: f64,
    /// Fraction of requirements with at least one compliance tag, in [0,1].
    pub compliance: f64,
    /// Percentage of requirements covered by a test case, in [0,100].
    pub coverage_percentage: f64,
    pub total_requirements: usize,
    pub total_test_cases: usize,
    pub average_test_cases_per_requirement: f64,
    pub quality_passed: bool,
    #[serde(default)]
    pub failed_checks: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

// ── Workflow ─────────────────────────────────────────────────────

/// Workflow run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    StageFailed,
    Retrying,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves: pending → running → (stage_failed ⇄ retrying)* → terminal.
    /// A stage that recovers on retry, or a degraded continuation, returns to running.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Running) => true,
            (Running, Running | StageFailed | Completed) => true,
            (StageFailed, Retrying | Running) => true,
            (Retrying, Running | StageFailed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::StageFailed => "stage_failed",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six workflow stages, in their fixed execution order.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    DocumentParser,
    RequirementExtractor,
    ComplianceMapper,
    TestGenerator,
    QualityValidator,
    Finalizer,
}

impl StageKind {
    pub const ORDER: [StageKind; 6] = [
        Self::DocumentParser,
        Self::RequirementExtractor,
        Self::ComplianceMapper,
        Self::TestGenerator,
        Self::QualityValidator,
        Self::Finalizer,
    ];

    /// The stage after this one, or `None` for the Finalizer.
    pub fn next(&self) -> Option<StageKind> {
        let idx = Self::ORDER.iter().position(|s| s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    /// Critical stages abort the run once their retries are exhausted.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::DocumentParser | Self::RequirementExtractor | Self::TestGenerator
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentParser => "document_parser",
            Self::RequirementExtractor => "requirement_extractor",
            Self::ComplianceMapper => "compliance_mapper",
            Self::TestGenerator => "test_generator",
            Self::QualityValidator => "quality_validator",
            Self::Finalizer => "finalizer",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only error log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Stage that produced the entry; `None` for run-level entries.
    pub stage: Option<StageKind>,
    /// Taxonomy label, e.g. `ExtractionError`, or `Note` for non-fatal notes.
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcomeKind {
    Succeeded,
    Failed,
    Degraded,
}

/// History entry for one stage execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub attempt: u32,
    pub outcome: StageOutcomeKind,
    pub duration_ms: u64,
}

/// Summary report produced by the Finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub session_id: SessionId,
    pub status: RunStatus,
    pub documents_received: usize,
    pub documents_processed: usize,
    pub requirements_extracted: usize,
    pub compliance_mappings: usize,
    pub test_cases_generated: usize,
    pub test_cases_by_category: BTreeMap<TestCategory, usize>,
    pub quality: Option<QualityScores>,
    pub stage_history: Vec<StageRecord>,
    pub degraded_stages: Vec<StageKind>,
    pub error_log: Vec<ErrorEntry>,
}

/// The single record threaded through every workflow stage.
///
/// `session_id` and `input_documents` are fixed at construction and only
/// readable afterwards. Everything else is written by the engine when it
/// applies a stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    session_id: SessionId,
    input_documents: Vec<InputDocument>,
    /// Standards requested by the caller; empty means all standards.
    pub compliance_standards: BTreeSet<ComplianceStandard>,
    #[serde(default)]
    pub parsed_documents: Vec<ParsedDocument>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub compliance_mappings: ComplianceMappings,
    /// Model's reason for each requirement's tags, by requirement id.
    #[serde(default)]
    pub mapping_rationale: BTreeMap<String, String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub quality_scores: Option<QualityScores>,
    #[serde(default)]
    pub status: RunStatus,
    /// Stage to run next when the record is resumed.
    #[serde(default)]
    pub current_stage: Option<StageKind>,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
    #[serde(default)]
    pub retry_counts: BTreeMap<StageKind, u32>,
    #[serde(default)]
    pub degraded_stages: Vec<StageKind>,
    #[serde(default)]
    pub history: Vec<StageRecord>,
    #[serde(default)]
    pub report: Option<FinalReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        documents: Vec<InputDocument>,
        compliance_standards: impl IntoIterator<Item = ComplianceStandard>,
    ) -> Self {
        Self::with_session(SessionId::new(), documents, compliance_standards)
    }

    pub fn with_session(
        session_id: SessionId,
        documents: Vec<InputDocument>,
        compliance_standards: impl IntoIterator<Item = ComplianceStandard>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            input_documents: documents,
            compliance_standards: compliance_standards.into_iter().collect(),
            parsed_documents: vec![],
            requirements: vec![],
            compliance_mappings: BTreeMap::new(),
            mapping_rationale: BTreeMap::new(),
            test_cases: vec![],
            quality_scores: None,
            status: RunStatus::Pending,
            current_stage: None,
            error_log: vec![],
            retry_counts: BTreeMap::new(),
            degraded_stages: vec![],
            history: vec![],
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn input_documents(&self) -> &[InputDocument] {
        &self.input_documents
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next` if the transition is allowed. Returns whether it moved.
    pub fn advance_status(&mut self, next: RunStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.session_id,
                from = %self.status,
                to = %next,
                "Refusing status transition"
            );
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Standards eligible for tagging: the requested set, or all of them.
    pub fn effective_standards(&self) -> Vec<ComplianceStandard> {
        if self.compliance_standards.is_empty() {
            ComplianceStandard::ALL.to_vec()
        } else {
            self.compliance_standards.iter().copied().collect()
        }
    }

    pub fn requirement_ids(&self) -> HashSet<&str> {
        self.requirements.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn retries(&self, stage: StageKind) -> u32 {
        self.retry_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Increment and return the retry count for `stage`.
    pub fn bump_retry(&mut self, stage: StageKind) -> u32 {
        let count = self.retry_counts.entry(stage).or_insert(0);
        *count += 1;
        *count
    }

    pub fn log_error(&mut self, stage: Option<StageKind>, error: &CaseforgeError) {
        self.push_log(stage, error.label(), error.to_string());
    }

    /// Record a non-fatal note (partial failure, dropped tag, degraded output).
    pub fn log_note(&mut self, stage: Option<StageKind>, message: impl Into<String>) {
        self.push_log(stage, "Note", message.into());
    }

    fn push_log(&mut self, stage: Option<StageKind>, kind: &str, message: String) {
        self.error_log.push(ErrorEntry {
            stage,
            kind: kind.to_string(),
            message,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Compact view of a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: RunStatus,
    pub current_stage: Option<StageKind>,
    pub requirements: usize,
    pub test_cases: usize,
    pub errors: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StateRecord> for SessionSummary {
    fn from(state: &StateRecord) -> Self {
        Self {
            session_id: state.session_id().clone(),
            status: state.status,
            current_stage: state.current_stage,
            requirements: state.requirements.len(),
            test_cases: state.test_cases.len(),
            errors: state.error_log.len(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// What `process_documents` hands back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub session_id: SessionId,
    pub status: RunStatus,
    pub requirements: Vec<Requirement>,
    pub compliance_mappings: ComplianceMappings,
    #[serde(default)]
    pub mapping_rationale: BTreeMap<String, String>,
    pub test_cases: Vec<TestCase>,
    pub quality_scores: Option<QualityScores>,
    pub errors: Vec<ErrorEntry>,
    pub report: Option<FinalReport>,
}

impl From<StateRecord> for ProcessingResult {
    fn from(state: StateRecord) -> Self {
        Self {
            success: state.status == RunStatus::Completed,
            session_id: state.session_id,
            status: state.status,
            requirements: state.requirements,
            compliance_mappings: state.compliance_mappings,
            mapping_rationale: state.mapping_rationale,
            test_cases: state.test_cases,
            quality_scores: state.quality_scores,
            errors: state.error_log,
            report: state.report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_only() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(StageFailed));
        assert!(StageFailed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(StageFailed));
        assert!(Retrying.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(StageFailed.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_advance_status_refuses_regression() {
        let mut state = StateRecord::new(vec![], []);
        assert!(state.advance_status(RunStatus::Running));
        assert!(state.advance_status(RunStatus::Failed));
        assert!(!state.advance_status(RunStatus::Running));
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[test]
    fn test_stage_order_and_criticality() {
        assert_eq!(
            StageKind::DocumentParser.next(),
            Some(StageKind::RequirementExtractor)
        );
        assert_eq!(StageKind::QualityValidator.next(), Some(StageKind::Finalizer));
        assert_eq!(StageKind::Finalizer.next(), None);

        assert!(StageKind::TestGenerator.is_critical());
        assert!(!StageKind::ComplianceMapper.is_critical());
        assert!(!StageKind::QualityValidator.is_critical());
    }

    #[test]
    fn test_compliance_parse_variants() {
        assert_eq!(ComplianceStandard::parse("HIPAA"), Some(ComplianceStandard::Hipaa));
        assert_eq!(
            ComplianceStandard::parse("IEC 62304"),
            Some(ComplianceStandard::Iec62304)
        );
        assert_eq!(
            ComplianceStandard::parse("iso_27001"),
            Some(ComplianceStandard::Iso27001)
        );
        assert_eq!(ComplianceStandard::parse("SOC2"), None);
    }

    #[test]
    fn test_document_format_detection() {
        assert_eq!(DocumentFormat::from_filename("reqs.MD"), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_filename("manual.pdf"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_filename("README"), DocumentFormat::Unknown);
    }

    #[test]
    fn test_state_serde_with_enum_keys() {
        let mut state = StateRecord::new(
            vec![InputDocument::from_text("a.txt", "The system shall log in.")],
            [ComplianceStandard::Hipaa],
        );
        state.bump_retry(StageKind::RequirementExtractor);
        state
            .compliance_mappings
            .insert("REQ-1".into(), [ComplianceStandard::Hipaa].into_iter().collect());

        let json = serde_json::to_string(&state).unwrap();
        let back: StateRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.retries(StageKind::RequirementExtractor), 1);
    }

    #[test]
    fn test_processing_result_success_tracks_status() {
        let mut state = StateRecord::new(vec![], []);
        state.advance_status(RunStatus::Running);
        state.advance_status(RunStatus::Completed);
        let result = ProcessingResult::from(state);
        assert!(result.success);
    }
}
