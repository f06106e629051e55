use std::collections::HashSet;

use futures::future::BoxFuture;
use tracing::info;

use caseforge_core::config::QualityThresholds;
use caseforge_core::types::{
    ComplianceMappings, QualityScores, Requirement, StageKind, StateRecord, TestCase,
};

use crate::stage::{RetryHint, Stage, StageOutput, StageResult, StageSuccess};

// Field weights for per-test-case accuracy
const TITLE_WEIGHT: f64 = 0.2;
const DESCRIPTION_WEIGHT: f64 = 0.2;
const STEPS_WEIGHT: f64 = 0.3;
const EXPECTED_WEIGHT: f64 = 0.3;

/// Scores requirements and test cases against the configured thresholds.
pub struct QualityValidator {
    thresholds: QualityThresholds,
}

impl QualityValidator {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }
}

impl Stage for QualityValidator {
    fn kind(&self) -> StageKind {
        StageKind::QualityValidator
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        _hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let scores = score(
                &state.requirements,
                &state.test_cases,
                &state.compliance_mappings,
                &self.thresholds,
            );
            info!(
                completeness = scores.completeness,
                accuracy = scores.accuracy,
                traceability = scores.traceability,
                passed = scores.quality_passed,
                "Quality validation complete"
            );
            Ok(StageSuccess::new(StageOutput::Quality(scores)))
        })
    }
}

/// Compute every quality metric. Pure; empty inputs score zero.
pub fn score(
    requirements: &[Requirement],
    test_cases: &[TestCase],
    mappings: &ComplianceMappings,
    thresholds: &QualityThresholds,
) -> QualityScores {
    let total_requirements = requirements.len();
    let total_test_cases = test_cases.len();

    let known: HashSet<&str> = requirements.iter().map(|r| r.id.as_str()).collect();
    let covered: HashSet<&str> = test_cases
        .iter()
        .map(|c| c.requirement_id.as_str())
        .filter(|id| known.contains(id))
        .collect();
    let traceable = test_cases
        .iter()
        .filter(|c| known.contains(c.requirement_id.as_str()))
        .count();
    let tagged = requirements
        .iter()
        .filter(|r| mappings.get(&r.id).is_some_and(|tags| !tags.is_empty()))
        .count();

    let completeness = ratio(covered.len(), total_requirements);
    let traceability = ratio(traceable, total_test_cases);
    let compliance = ratio(tagged, total_requirements);
    let accuracy = if test_cases.is_empty() {
        0.0
    } else {
        test_cases.iter().map(field_completeness).sum::<f64>() / total_test_cases as f64
    };
    let coverage_percentage = completeness * 100.0;

    let mut failed_checks = Vec::new();
    let mut recommendations = Vec::new();
    let mut check = |name: &str, value: f64, min: f64, advice: &str| {
        if value < min {
            failed_checks.push(format!("{} {:.2} below minimum {:.2}", name, value, min));
            recommendations.push(advice.to_string());
        }
    };
    check(
        "completeness",
        completeness,
        thresholds.min_completeness_score,
        "Generate test cases for every requirement that has none",
    );
    check(
        "accuracy",
        accuracy,
        thresholds.min_accuracy_score,
        "Fill in missing descriptions, steps, and expected results",
    );
    check(
        "traceability",
        traceability,
        thresholds.min_traceability_score,
        "Link every test case to an existing requirement",
    );
    check(
        "compliance",
        compliance,
        thresholds.min_compliance_score,
        "Review requirements without any compliance standard",
    );
    check(
        "coverage_percentage",
        coverage_percentage,
        thresholds.min_coverage_percentage,
        "Increase requirement coverage",
    );

    QualityScores {
        completeness,
        accuracy,
        traceability,
        compliance,
        coverage_percentage,
        total_requirements,
        total_test_cases,
        average_test_cases_per_requirement: ratio(total_test_cases, total_requirements),
        quality_passed: failed_checks.is_empty(),
        failed_checks,
        recommendations,
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn field_completeness(case: &TestCase) -> f64 {
    let mut total = 0.0;
    if !case.title.trim().is_empty() {
        total += TITLE_WEIGHT;
    }
    if !case.description.trim().is_empty() {
        total += DESCRIPTION_WEIGHT;
    }
    if !case.steps.is_empty() {
        total += STEPS_WEIGHT;
    }
    if !case.expected_result.trim().is_empty() {
        total += EXPECTED_WEIGHT;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseforge_core::types::{ComplianceStandard, Priority, RequirementType, TestCategory};

    fn requirement(id: &str) -> Requirement {
        Requirement {
            id: id.into(),
            title: id.into(),
            description: id.into(),
            requirement_type: RequirementType::Functional,
            priority: Priority::Medium,
            source_document: "a.txt".into(),
            source_section: None,
            acceptance_criteria: vec![],
        }
    }

    fn case(requirement_id: &str, complete: bool) -> TestCase {
        TestCase {
            id: format!("TC-{}", requirement_id),
            requirement_id: requirement_id.into(),
            category: TestCategory::Positive,
            title: "title".into(),
            description: if complete { "desc".into() } else { String::new() },
            priority: Priority::Medium,
            preconditions: vec![],
            steps: vec!["step".into()],
            expected_result: if complete { "ok".into() } else { String::new() },
            compliance_standards: vec![],
        }
    }

    #[test]
    fn test_perfect_run_passes() {
        let reqs = vec![requirement("R1"), requirement("R2")];
        let cases = vec![case("R1", true), case("R2", true), case("R2", true)];
        let mappings: ComplianceMappings = [
            ("R1".to_string(), [ComplianceStandard::Hipaa].into_iter().collect()),
            ("R2".to_string(), [ComplianceStandard::Fda].into_iter().collect()),
        ]
        .into_iter()
        .collect();

        let s = score(&reqs, &cases, &mappings, &QualityThresholds::default());
        assert_eq!(s.completeness, 1.0);
        assert_eq!(s.traceability, 1.0);
        assert!((s.accuracy - 1.0).abs() < 1e-9);
        assert_eq!(s.coverage_percentage, 100.0);
        assert_eq!(s.average_test_cases_per_requirement, 1.5);
        assert!(s.quality_passed);
        assert!(s.failed_checks.is_empty());
    }

    #[test]
    fn test_partial_coverage_and_accuracy() {
        let reqs = vec![requirement("R1"), requirement("R2")];
        let cases = vec![case("R1", false), case("GHOST", true)];
        let s = score(&reqs, &cases, &ComplianceMappings::new(), &QualityThresholds::default());

        assert_eq!(s.completeness, 0.5);
        assert_eq!(s.traceability, 0.5);
        // (0.5 + 1.0) / 2
        assert!((s.accuracy - 0.75).abs() < 1e-9);
        assert_eq!(s.compliance, 0.0);
        assert!(!s.quality_passed);
        assert_eq!(s.failed_checks.len(), 5);
        assert_eq!(s.recommendations.len(), 5);
    }

    #[test]
    fn test_zero_cases_fails_quality() {
        let reqs = vec![requirement("R1")];
        let s = score(&reqs, &[], &ComplianceMappings::new(), &QualityThresholds::default());
        assert_eq!(s.completeness, 0.0);
        assert_eq!(s.total_test_cases, 0);
        assert!(!s.quality_passed);
    }

    #[test]
    fn test_thresholds_gate_pass() {
        let reqs = vec![requirement("R1"), requirement("R2")];
        let cases = vec![case("R1", true)];
        let lenient = QualityThresholds {
            min_completeness_score: 0.5,
            min_accuracy_score: 0.5,
            min_traceability_score: 0.5,
            min_compliance_score: 0.0,
            min_coverage_percentage: 50.0,
        };
        assert!(score(&reqs, &cases, &ComplianceMappings::new(), &lenient).quality_passed);
    }
}
