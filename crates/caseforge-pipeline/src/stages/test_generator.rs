use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use caseforge_core::config::GenerationConfig;
use caseforge_core::error::CaseforgeError;
use caseforge_core::traits::{ModelClient, ModelRequest};
use caseforge_core::types::{
    ComplianceStandard, Priority, Requirement, StageKind, StateRecord, TestCase, TestCategory,
};

use crate::json::{extract_payload, payload_items, str_field, str_list};
use crate::prompts;
use crate::similarity::dedup_similar;
use crate::stage::{RetryHint, Stage, StageFailure, StageOutput, StageResult, StageSuccess};

/// Generates test cases per requirement, one model call each.
pub struct TestGenerator {
    model: Arc<dyn ModelClient>,
    timeout: Duration,
    config: GenerationConfig,
    max_concurrent: usize,
}

type RequirementOutcome = Result<(Vec<TestCase>, Vec<String>), StageFailure>;

impl TestGenerator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        timeout: Duration,
        config: GenerationConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            model,
            timeout,
            config,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Categories enabled by configuration. Positive cases are always generated.
    pub fn enabled_categories(&self) -> Vec<TestCategory> {
        TestCategory::ALL
            .into_iter()
            .filter(|c| match c {
                TestCategory::Positive => true,
                TestCategory::Negative => self.config.include_negative,
                TestCategory::Boundary => self.config.include_boundary,
                TestCategory::Security => self.config.include_security,
            })
            .collect()
    }

    async fn generate(&self, state: &StateRecord, hint: Option<&RetryHint>) -> StageResult {
        let categories = self.enabled_categories();
        let known: HashSet<&str> = state.requirement_ids();

        let futs: Vec<_> = state
            .requirements
            .iter()
            .map(|req| {
                let standards: Vec<ComplianceStandard> = state
                    .compliance_mappings
                    .get(&req.id)
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default();
                let rationale = state.mapping_rationale.get(&req.id).map(String::as_str);
                let categories = &categories;
                let known = &known;
                async move {
                    let outcome = self
                        .generate_for(req, &standards, rationale, categories, known, hint)
                        .await;
                    (req.id.clone(), outcome)
                }
            })
            .collect();
        let outcomes: Vec<(String, RequirementOutcome)> = stream::iter(futs)
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut cases = Vec::new();
        let mut notes = Vec::new();
        let mut first_failure = None;
        let mut failed_outputs = BTreeMap::new();
        let mut succeeded = 0usize;

        for (requirement_id, outcome) in outcomes {
            match outcome {
                Ok((found, dropped)) => {
                    succeeded += 1;
                    cases.extend(found);
                    notes.extend(dropped);
                }
                Err(mut failure) => {
                    warn!(requirement_id = %requirement_id, error = %failure, "Test generation failed for requirement");
                    notes.push(format!(
                        "No test cases generated for {}: {}",
                        requirement_id, failure.error
                    ));
                    if let Some(raw) = failure.raw_output.take() {
                        failed_outputs.insert(requirement_id, raw);
                    }
                    first_failure.get_or_insert(failure);
                }
            }
        }

        if succeeded == 0 {
            let failure = first_failure.unwrap_or_else(|| {
                StageFailure::new(CaseforgeError::Generation("no requirements to cover".into()))
            });
            return Err(failure.with_call_outputs(failed_outputs));
        }

        let cases = assign_ids(cases);
        info!(count = cases.len(), "Test cases generated");
        Ok(StageSuccess::new(StageOutput::TestCases(cases)).with_notes(notes))
    }

    async fn generate_for(
        &self,
        req: &Requirement,
        standards: &[ComplianceStandard],
        rationale: Option<&str>,
        categories: &[TestCategory],
        known: &HashSet<&str>,
        hint: Option<&RetryHint>,
    ) -> RequirementOutcome {
        let prompt = prompts::with_retry_hint(
            prompts::generation(
                req,
                standards,
                rationale,
                categories,
                self.config.max_test_cases_per_requirement,
            ),
            hint,
            Some(&req.id),
        );
        let request = ModelRequest::new(prompt, self.timeout).with_system(prompts::SYSTEM_PROMPT);
        let text = self.model.generate(request).await?;

        let Some(items) = extract_payload(&text, "test_cases")
            .as_ref()
            .and_then(|p| payload_items(p, "test_cases").cloned())
        else {
            return Err(StageFailure::with_output(
                CaseforgeError::Generation("response did not contain a test_cases payload".into()),
                text,
            ));
        };

        let mut cases = Vec::new();
        let mut notes = Vec::new();
        for item in &items {
            let Some(case) = case_from_value(item, req, standards) else {
                continue;
            };
            if !known.contains(case.requirement_id.as_str()) {
                warn!(requirement_id = %case.requirement_id, "Dropping test case with dangling requirement reference");
                notes.push(format!(
                    "Dropped test case '{}' referencing unknown requirement {}",
                    case.title, case.requirement_id
                ));
                continue;
            }
            if !categories.contains(&case.category) {
                debug!(category = %case.category, "Dropping test case in disabled category");
                continue;
            }
            cases.push(case);
        }

        let found = cases.len();
        let mut cases = dedup_similar(cases, |c| c.title.as_str());
        if cases.len() < found {
            debug!(requirement_id = %req.id, dropped = found - cases.len(), "Dropped near-duplicate test cases");
        }

        let cap = self.config.max_test_cases_per_requirement;
        if cases.len() > cap {
            notes.push(format!(
                "Kept {} of {} test cases for {}",
                cap,
                cases.len(),
                req.id
            ));
            cases.truncate(cap);
        }
        Ok((cases, notes))
    }
}

impl Stage for TestGenerator {
    fn kind(&self) -> StageKind {
        StageKind::TestGenerator
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(self.generate(state, hint))
    }
}

fn case_from_value(
    item: &Value,
    req: &Requirement,
    standards: &[ComplianceStandard],
) -> Option<TestCase> {
    let title = str_field(item, &["title", "name"])?.to_string();
    let steps = str_list(item, &["steps", "test_steps"]);
    let category = str_field(item, &["category", "type"])
        .and_then(TestCategory::parse)
        .unwrap_or(TestCategory::Positive);

    Some(TestCase {
        id: str_field(item, &["id", "test_case_id"])
            .map(str::to_string)
            .unwrap_or_default(),
        requirement_id: str_field(item, &["requirement_id", "requirement_reference"])
            .unwrap_or(&req.id)
            .to_string(),
        category,
        title,
        description: str_field(item, &["description"]).unwrap_or("").to_string(),
        priority: str_field(item, &["priority"])
            .map(Priority::parse_lenient)
            .unwrap_or(req.priority),
        preconditions: str_list(item, &["preconditions"]),
        steps,
        expected_result: str_field(item, &["expected_result", "expected", "expected_results"])
            .unwrap_or("")
            .to_string(),
        compliance_standards: standards.to_vec(),
    })
}

/// Keep unique model-supplied ids, generate `TC-{requirement}-{CAT}-{n:03}` otherwise.
fn assign_ids(mut cases: Vec<TestCase>) -> Vec<TestCase> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut counters: HashMap<(String, TestCategory), usize> = HashMap::new();

    for case in cases.iter_mut() {
        let id = case.id.trim().to_string();
        if !id.is_empty() && seen.insert(id.clone()) {
            case.id = id;
            continue;
        }
        let key = (case.requirement_id.clone(), case.category);
        loop {
            let n = counters.entry(key.clone()).or_insert(0);
            *n += 1;
            let candidate = format!("TC-{}-{}-{:03}", case.requirement_id, case.category.code(), n);
            if seen.insert(candidate.clone()) {
                case.id = candidate;
                break;
            }
        }
    }
    cases
}

/// Test cases per category, for reporting.
pub fn count_by_category(cases: &[TestCase]) -> BTreeMap<TestCategory, usize> {
    let mut counts = BTreeMap::new();
    for case in cases {
        *counts.entry(case.category).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseforge_core::error::ModelErrorKind;
    use caseforge_core::types::RequirementType;
    use caseforge_test_utils::{generation_response, ScriptedModel};

    fn state() -> StateRecord {
        let mut state = StateRecord::new(vec![], []);
        state.requirements = vec![Requirement {
            id: "REQ-1".into(),
            title: "Encrypt".into(),
            description: "Encrypt patient data".into(),
            requirement_type: RequirementType::Security,
            priority: Priority::High,
            source_document: "a.txt".into(),
            source_section: None,
            acceptance_criteria: vec![],
        }];
        state
            .compliance_mappings
            .insert("REQ-1".into(), [ComplianceStandard::Hipaa].into_iter().collect());
        state
    }

    fn generator(model: ScriptedModel, config: GenerationConfig) -> TestGenerator {
        TestGenerator::new(Arc::new(model), Duration::from_secs(1), config, 2)
    }

    fn cases_of(result: StageResult) -> Vec<TestCase> {
        match result.unwrap().output {
            StageOutput::TestCases(c) => c,
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generates_and_assigns_ids() {
        let response = generation_response(serde_json::json!([
            {"category": "positive", "title": "Happy", "steps": ["a"], "expected_result": "ok"},
            {"category": "security", "title": "Attack", "steps": ["b"], "expected_result": "blocked"},
            {"category": "positive", "title": "Happy 2", "steps": ["c"], "expected_result": "ok"}
        ]));
        let stage = generator(ScriptedModel::new(vec![Ok(response)]), GenerationConfig::default());
        let cases = cases_of(stage.run(&state(), None).await);

        let ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["TC-REQ-1-POS-001", "TC-REQ-1-SEC-001", "TC-REQ-1-POS-002"]);
        assert!(cases.iter().all(|c| c.requirement_id == "REQ-1"));
        assert_eq!(cases[1].compliance_standards, vec![ComplianceStandard::Hipaa]);
        assert_eq!(cases[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_dangling_reference_dropped() {
        let response = generation_response(serde_json::json!([
            {"requirement_id": "REQ-999", "title": "Orphan", "steps": [], "expected_result": ""},
            {"title": "Kept", "steps": ["x"], "expected_result": "y"}
        ]));
        let stage = generator(ScriptedModel::new(vec![Ok(response)]), GenerationConfig::default());
        let result = stage.run(&state(), None).await.unwrap();
        assert_eq!(result.notes.len(), 1);
        assert!(matches!(result.output, StageOutput::TestCases(ref c) if c.len() == 1));
    }

    #[tokio::test]
    async fn test_disabled_categories_and_cap() {
        let response = generation_response(serde_json::json!([
            {"category": "boundary", "title": "Edge", "steps": ["a"], "expected_result": "ok"},
            {"category": "positive", "title": "P1", "steps": ["a"], "expected_result": "ok"},
            {"category": "negative", "title": "N1", "steps": ["a"], "expected_result": "ok"},
            {"category": "positive", "title": "P2", "steps": ["a"], "expected_result": "ok"}
        ]));
        let config = GenerationConfig {
            include_boundary: false,
            max_test_cases_per_requirement: 2,
            ..GenerationConfig::default()
        };
        let stage = generator(ScriptedModel::new(vec![Ok(response)]), config);
        assert!(!stage.enabled_categories().contains(&TestCategory::Boundary));

        let cases = cases_of(stage.run(&state(), None).await);
        let titles: Vec<&str> = cases.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["P1", "N1"]);
    }

    #[tokio::test]
    async fn test_zero_cases_is_not_a_failure() {
        let stage = generator(
            ScriptedModel::new(vec![Ok(generation_response(serde_json::json!([])))]),
            GenerationConfig::default(),
        );
        assert!(cases_of(stage.run(&state(), None).await).is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_is_generation_error() {
        let stage = generator(
            ScriptedModel::new(vec![Ok("Sorry, no.".into())]),
            GenerationConfig::default(),
        );
        let failure = stage.run(&state(), None).await.unwrap_err();
        assert_eq!(failure.error.label(), "GenerationError");
        assert_eq!(
            failure.call_outputs.get("REQ-1").map(String::as_str),
            Some("Sorry, no.")
        );
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let stage = generator(
            ScriptedModel::new(vec![Err(CaseforgeError::model(ModelErrorKind::Timeout, "slow"))]),
            GenerationConfig::default(),
        );
        let failure = stage.run(&state(), None).await.unwrap_err();
        assert!(!failure.error.is_fatal());
    }

    #[test]
    fn test_count_by_category() {
        let case = |category| TestCase {
            id: String::new(),
            requirement_id: "R".into(),
            category,
            title: "t".into(),
            description: String::new(),
            priority: Priority::Medium,
            preconditions: vec![],
            steps: vec![],
            expected_result: String::new(),
            compliance_standards: vec![],
        };
        let counts = count_by_category(&[
            case(TestCategory::Security),
            case(TestCategory::Security),
            case(TestCategory::Positive),
        ]);
        assert_eq!(counts[&TestCategory::Security], 2);
        assert_eq!(counts[&TestCategory::Positive], 1);
    }

    #[tokio::test]
    async fn test_bracketed_prose_before_test_cases() {
        let response = format!(
            "Covering categories [positive, security] as asked:\n{}",
            generation_response(serde_json::json!([
                {"category": "positive", "title": "Happy", "steps": ["a"], "expected_result": "ok"}
            ]))
        );
        let stage = generator(ScriptedModel::new(vec![Ok(response)]), GenerationConfig::default());
        let cases = cases_of(stage.run(&state(), None).await);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].title, "Happy");
    }

    #[tokio::test]
    async fn test_near_duplicate_titles_dropped() {
        let response = generation_response(serde_json::json!([
            {"category": "positive", "title": "Verify patient record is stored encrypted", "steps": ["a"]},
            {"category": "positive", "title": "Verify the patient record is stored encrypted", "steps": ["b"]},
            {"category": "security", "title": "Raw disk read reveals no PHI", "steps": ["c"]}
        ]));
        let stage = generator(ScriptedModel::new(vec![Ok(response)]), GenerationConfig::default());
        let cases = cases_of(stage.run(&state(), None).await);
        let titles: Vec<&str> = cases.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Verify patient record is stored encrypted", "Raw disk read reveals no PHI"]
        );
    }

    #[tokio::test]
    async fn test_retry_echoes_each_requirement_its_own_output() {
        let mut state = state();
        let mut second = state.requirements[0].clone();
        second.id = "REQ-2".into();
        second.description = "Audit every chart access".into();
        state.requirements.push(second);

        let model = ScriptedModel::from_fn(|prompt| {
            if prompt.contains("Requirement REQ-1:") {
                Ok("garbage for one".into())
            } else {
                Ok("garbage for two".into())
            }
        });
        let stats = model.stats();
        let stage = generator(model, GenerationConfig::default());

        let failure = stage.run(&state, None).await.unwrap_err();
        let hint = RetryHint::from_failure(1, failure);
        let _ = stage.run(&state, Some(&hint)).await;

        let prompts = stats.prompts();
        let retry_two = prompts
            .iter()
            .skip(2)
            .find(|p| p.contains("Requirement REQ-2:"))
            .unwrap();
        assert!(retry_two.contains("garbage for two"));
        assert!(!retry_two.contains("garbage for one"));
    }

    #[tokio::test]
    async fn test_mapping_rationale_reaches_prompt() {
        let mut state = state();
        state
            .mapping_rationale
            .insert("REQ-1".into(), "Stored PHI must be protected".into());
        let model = ScriptedModel::new(vec![Ok(generation_response(serde_json::json!([])))]);
        let stats = model.stats();
        generator(model, GenerationConfig::default())
            .run(&state, None)
            .await
            .unwrap();
        assert!(stats.prompts()[0].contains("Stored PHI must be protected"));
    }
}
