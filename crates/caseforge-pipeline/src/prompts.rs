//! Prompt text for the model-backed stages.

use caseforge_core::types::{ComplianceStandard, Requirement, TestCategory};

use crate::stage::RetryHint;

/// Largest slice of a malformed response echoed back in a reformat prompt.
const MAX_ECHOED_OUTPUT: usize = 2_000;

pub const SYSTEM_PROMPT: &str = "You are a senior quality engineer for regulated healthcare \
software. You read requirement documents and produce precise, traceable artefacts. \
Always answer with a single JSON object and nothing else.";

pub fn extraction(filename: &str, segment: &str, part: usize, parts: usize) -> String {
    format!(
        r#"## Task: requirement extraction

Extract every software requirement from the document excerpt below.
Document: {filename} (part {part} of {parts})

For each requirement provide:
- "id": identifier used in the document, or an empty string
- "title": short summary
- "description": the full requirement statement
- "type": one of functional, non_functional, performance, security, compliance, usability
- "priority": one of critical, high, medium, low
- "section": document section the requirement appears in, if any
- "acceptance_criteria": list of verifiable conditions

Respond with a JSON object of the form {{"requirements": [ ... ]}}.

---
{segment}
---"#
    )
}

pub fn compliance(requirements: &[Requirement], standards: &[ComplianceStandard]) -> String {
    let standard_list: String = standards
        .iter()
        .map(|s| format!("- {}: {}\n", s.as_str(), s.description()))
        .collect();
    let requirement_list: String = requirements
        .iter()
        .map(|r| format!("- [{}] {}: {}\n", r.id, r.title, r.description))
        .collect();
    format!(
        r#"## Task: compliance mapping

Decide which healthcare regulatory standards apply to each requirement.
Only use these standards:
{standard_list}
A requirement may map to zero or more standards.

Respond with a JSON object of the form
{{"mappings": [{{"requirement_id": "...", "standards": ["..."], "rationale": "..."}}]}}.

Requirements:
{requirement_list}"#
    )
}

pub fn generation(
    requirement: &Requirement,
    standards: &[ComplianceStandard],
    rationale: Option<&str>,
    categories: &[TestCategory],
    max_cases: usize,
) -> String {
    let tags = if standards.is_empty() {
        "none".to_string()
    } else {
        standards
            .iter()
            .map(ComplianceStandard::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let category_list = categories
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let criteria = if requirement.acceptance_criteria.is_empty() {
        String::from("(none given)")
    } else {
        requirement.acceptance_criteria.join("; ")
    };
    let rationale = rationale
        .map(|r| format!("\nWhy these standards apply: {r}"))
        .unwrap_or_default();
    format!(
        r#"## Task: test case generation

Write test cases for the requirement below. Cover these categories: {category_list}.
Write at most {max_cases} test cases. Security test cases must address the
listed compliance standards.

For each test case provide "requirement_id", "category", "title", "description",
"priority", "preconditions" (list), "steps" (list) and "expected_result".

Respond with a JSON object of the form {{"test_cases": [ ... ]}}.

Requirement {id}: {title}
{description}
Acceptance criteria: {criteria}
Compliance standards: {tags}{rationale}"#,
        id = requirement.id,
        title = requirement.title,
        description = requirement.description,
    )
}

/// Append reformat instructions after a failed attempt.
///
/// `call` names one call of a fan-out stage; only that call's own previous
/// output is echoed back.
pub fn with_retry_hint(prompt: String, hint: Option<&RetryHint>, call: Option<&str>) -> String {
    let Some(hint) = hint else {
        return prompt;
    };
    let previous = match call {
        Some(key) if !hint.concerns(key) => return prompt,
        Some(key) => hint.previous_outputs.get(key),
        None => hint.previous_output.as_ref(),
    };
    let mut out = prompt;
    out.push_str(&format!(
        "\n\n## Retry {}\nYour previous response could not be used: {}\n",
        hint.attempt, hint.issue
    ));
    if let Some(previous) = previous {
        let echoed: String = previous.chars().take(MAX_ECHOED_OUTPUT).collect();
        out.push_str("Previous response:\n<<<\n");
        out.push_str(&echoed);
        out.push_str("\n>>>\n");
    }
    out.push_str(
        "Answer again with ONLY a valid JSON object in exactly the structure requested above. \
No prose, no code fences.",
    );
    out
}
