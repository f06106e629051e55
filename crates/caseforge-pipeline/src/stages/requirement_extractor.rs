use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use caseforge_core::error::CaseforgeError;
use caseforge_core::traits::{ModelClient, ModelRequest};
use caseforge_core::types::{Priority, Requirement, RequirementType, StageKind, StateRecord};

use crate::json::{extract_payload, payload_items, str_field, str_list};
use crate::prompts;
use crate::similarity::dedup_similar;
use crate::stage::{RetryHint, Stage, StageFailure, StageOutput, StageResult, StageSuccess};

/// Longest title derived from a description when the model gives none.
const MAX_DERIVED_TITLE: usize = 80;

/// Calls the model once per text segment and collects structured requirements.
pub struct RequirementExtractor {
    model: Arc<dyn ModelClient>,
    timeout: Duration,
    max_input_chars: usize,
    max_concurrent: usize,
}

struct Segment<'a> {
    filename: &'a str,
    text: String,
    part: usize,
    parts: usize,
}

impl Segment<'_> {
    /// Identifies this segment's model call across retries.
    fn key(&self) -> String {
        format!("{}#{}", self.filename, self.part)
    }
}

struct SegmentResult {
    key: String,
    filename: String,
    outcome: Result<(Vec<Requirement>, String), StageFailure>,
}

impl RequirementExtractor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        timeout: Duration,
        max_input_chars: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            model,
            timeout,
            max_input_chars,
            max_concurrent: max_concurrent.max(1),
        }
    }

    async fn extract(&self, state: &StateRecord, hint: Option<&RetryHint>) -> StageResult {
        let max_chars = self.max_input_chars;
        let segments: Vec<Segment<'_>> = state
            .parsed_documents
            .iter()
            .flat_map(|doc| {
                let parts = segment_text(&doc.text, max_chars);
                let count = parts.len();
                parts.into_iter().enumerate().map(move |(i, text)| Segment {
                    filename: &doc.filename,
                    text,
                    part: i + 1,
                    parts: count,
                })
            })
            .collect();

        if segments.is_empty() {
            return Err(StageFailure::new(CaseforgeError::Extraction(
                "parsed documents contain no text".into(),
            )));
        }
        debug!(segments = segments.len(), "Extracting requirements");

        let futs: Vec<_> = segments
            .into_iter()
            .map(|segment| self.extract_segment(segment, hint))
            .collect();
        let results: Vec<SegmentResult> = stream::iter(futs)
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut requirements = Vec::new();
        let mut notes = Vec::new();
        let mut first_failure = None;
        let mut failed_outputs = BTreeMap::new();
        let mut usable_outputs = BTreeMap::new();

        for SegmentResult {
            key,
            filename,
            outcome,
        } in results
        {
            match outcome {
                Ok((found, raw)) => {
                    requirements.extend(found);
                    usable_outputs.insert(key, raw);
                }
                Err(mut failure) => {
                    warn!(filename = %filename, segment = %key, error = %failure, "Segment extraction failed");
                    notes.push(format!(
                        "Part of {} yielded no requirements: {}",
                        filename, failure.error
                    ));
                    if let Some(raw) = failure.raw_output.take() {
                        failed_outputs.insert(key, raw);
                    }
                    first_failure.get_or_insert(failure);
                }
            }
        }

        if usable_outputs.is_empty() {
            let failure = first_failure.unwrap_or_else(|| {
                StageFailure::new(CaseforgeError::Extraction("no segment succeeded".into()))
            });
            return Err(failure.with_call_outputs(failed_outputs));
        }
        if requirements.is_empty() {
            return Err(StageFailure::new(CaseforgeError::Extraction(
                "model returned no requirements".into(),
            ))
            .with_call_outputs(usable_outputs));
        }

        let found = requirements.len();
        let mut requirements = dedup_similar(requirements, |r| r.description.as_str());
        if requirements.len() < found {
            debug!(
                dropped = found - requirements.len(),
                "Dropped near-duplicate requirements"
            );
        }

        normalize_ids(&mut requirements);
        info!(count = requirements.len(), "Requirements extracted");
        Ok(StageSuccess::new(StageOutput::Requirements(requirements)).with_notes(notes))
    }

    async fn extract_segment(
        &self,
        segment: Segment<'_>,
        hint: Option<&RetryHint>,
    ) -> SegmentResult {
        let key = segment.key();
        let prompt = prompts::with_retry_hint(
            prompts::extraction(segment.filename, &segment.text, segment.part, segment.parts),
            hint,
            Some(&key),
        );
        let request = ModelRequest::new(prompt, self.timeout).with_system(prompts::SYSTEM_PROMPT);

        let outcome = match self.model.generate(request).await {
            Err(e) => Err(StageFailure::new(e)),
            Ok(text) => match parse_requirements(&text, segment.filename) {
                Some(found) => Ok((found, text)),
                None => Err(StageFailure::with_output(
                    CaseforgeError::Extraction(
                        "response did not contain a requirements payload".into(),
                    ),
                    text,
                )),
            },
        };
        SegmentResult {
            key,
            filename: segment.filename.to_string(),
            outcome,
        }
    }
}

impl Stage for RequirementExtractor {
    fn kind(&self) -> StageKind {
        StageKind::RequirementExtractor
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(self.extract(state, hint))
    }
}

/// Split text into segments of at most `max_chars` characters, breaking on
/// paragraph boundaries where possible.
pub fn segment_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();

        if para_len > max_chars {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = para.chars().collect();
            segments.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }

        let separator = if current.is_empty() { 0 } else { 2 };
        if current_len + separator + para_len > max_chars {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Parse a model response into requirements. `None` when no payload is found.
pub fn parse_requirements(text: &str, source_document: &str) -> Option<Vec<Requirement>> {
    let payload = extract_payload(text, "requirements")?;
    let items = payload_items(&payload, "requirements")?;
    Some(
        items
            .iter()
            .filter_map(|item| requirement_from_value(item, source_document))
            .collect(),
    )
}

fn requirement_from_value(item: &Value, source_document: &str) -> Option<Requirement> {
    if let Some(statement) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(Requirement {
            id: String::new(),
            title: derive_title(statement),
            description: statement.to_string(),
            requirement_type: RequirementType::default(),
            priority: Priority::default(),
            source_document: source_document.to_string(),
            source_section: None,
            acceptance_criteria: vec![],
        });
    }

    let description = str_field(item, &["description", "text", "requirement", "statement"]);
    let title = str_field(item, &["title", "name", "summary"]);
    let (title, description) = match (title, description) {
        (None, None) => return None,
        (Some(t), None) => (t.to_string(), t.to_string()),
        (None, Some(d)) => (derive_title(d), d.to_string()),
        (Some(t), Some(d)) => (t.to_string(), d.to_string()),
    };

    let id = str_field(item, &["id", "requirement_id"])
        .map(str::to_string)
        .or_else(|| item.get("id").filter(|v| v.is_number()).map(|v| v.to_string()))
        .unwrap_or_default();

    Some(Requirement {
        id,
        title,
        description,
        requirement_type: str_field(item, &["type", "requirement_type"])
            .map(RequirementType::parse_lenient)
            .unwrap_or_default(),
        priority: str_field(item, &["priority"])
            .map(Priority::parse_lenient)
            .unwrap_or_default(),
        source_document: source_document.to_string(),
        source_section: str_field(item, &["section", "source_section"]).map(str::to_string),
        acceptance_criteria: str_list(item, &["acceptance_criteria", "criteria"]),
    })
}

fn derive_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or(description);
    if first_line.chars().count() <= MAX_DERIVED_TITLE {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(MAX_DERIVED_TITLE).collect();
    title.push_str("...");
    title
}

/// Replace missing and duplicate ids with `REQ-{doc}-{n:03}`.
pub fn normalize_ids(requirements: &mut [Requirement]) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut counters: HashMap<String, usize> = HashMap::new();

    for req in requirements.iter_mut() {
        let id = req.id.trim().to_string();
        if !id.is_empty() && seen.insert(id.clone()) {
            req.id = id;
            continue;
        }
        let slug = document_slug(&req.source_document);
        loop {
            let n = counters.entry(slug.clone()).or_insert(0);
            *n += 1;
            let candidate = format!("REQ-{}-{:03}", slug, n);
            if seen.insert(candidate.clone()) {
                req.id = candidate;
                break;
            }
        }
    }
}

fn document_slug(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);
    let slug: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "DOC".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseforge_core::error::ModelErrorKind;
    use caseforge_core::types::{DocumentFormat, ParsedDocument};
    use caseforge_test_utils::{extraction_response, ScriptedModel};

    fn state_with_text(text: &str) -> StateRecord {
        let mut state = StateRecord::new(vec![], []);
        state.parsed_documents.push(ParsedDocument {
            filename: "security.txt".into(),
            format: DocumentFormat::Text,
            size_bytes: text.len(),
            word_count: text.split_whitespace().count(),
            text: text.into(),
        });
        state
    }

    fn state_with_docs(docs: &[(&str, &str)]) -> StateRecord {
        let mut state = StateRecord::new(vec![], []);
        for (filename, text) in docs {
            state.parsed_documents.push(ParsedDocument {
                filename: filename.to_string(),
                format: DocumentFormat::Text,
                size_bytes: text.len(),
                word_count: text.split_whitespace().count(),
                text: text.to_string(),
            });
        }
        state
    }

    fn requirements_of(result: StageResult) -> Vec<Requirement> {
        match result.unwrap().output {
            StageOutput::Requirements(reqs) => reqs,
            other => panic!("unexpected output: {other:?}"),
        }
    }

    /// Answers each segment with one requirement, slower for earlier documents.
    struct SlowFirstModel;

    impl ModelClient for SlowFirstModel {
        fn name(&self) -> &str {
            "slow-first"
        }

        fn generate(
            &self,
            request: ModelRequest,
        ) -> BoxFuture<'_, caseforge_core::error::Result<String>> {
            Box::pin(async move {
                let prompt = request.prompt;
                let (delay, description) = if prompt.contains("Document: a.txt") {
                    (40, "Encrypt patient records at rest")
                } else if prompt.contains("Document: b.txt") {
                    (20, "Write every chart access to the audit trail")
                } else if prompt.contains("(part 1 of 2)") {
                    (10, "Lock idle clinician sessions after fifteen minutes")
                } else {
                    (0, "Export discharge summaries as signed PDF files")
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(extraction_response(
                    serde_json::json!([{ "description": description }]),
                ))
            })
        }
    }

    fn extractor(model: ScriptedModel) -> RequirementExtractor {
        RequirementExtractor::new(Arc::new(model), Duration::from_secs(5), 12_000, 2)
    }

    #[test]
    fn test_segment_on_paragraphs() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        assert_eq!(segment_text(text, 10), vec!["aaaa\n\nbbbb", "cccc"]);
        assert_eq!(segment_text(text, 100), vec![text]);
        assert!(segment_text("  \n\n ", 10).is_empty());
    }

    #[test]
    fn test_segment_splits_long_paragraph() {
        let segments = segment_text(&"x".repeat(25), 10);
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.chars().count() <= 10));
    }

    #[test]
    fn test_normalize_ids_fills_and_dedups() {
        let mut reqs = parse_requirements(
            r#"{"requirements": [
                {"id": "R-1", "description": "a"},
                {"id": "R-1", "description": "b"},
                {"description": "c"}
            ]}"#,
            "docs/Security Policy.txt",
        )
        .unwrap();
        normalize_ids(&mut reqs);
        let ids: Vec<&str> = reqs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R-1", "REQ-SECURITY_POLICY-001", "REQ-SECURITY_POLICY-002"]);
    }

    #[test]
    fn test_parse_lenient_fields() {
        let reqs = parse_requirements(
            r#"```json
            {"requirements": [{
                "title": "Encrypt",
                "text": "Encrypt patient data",
                "type": "Non-Functional",
                "priority": "urgent",
                "acceptance_criteria": "AES-256\nKeys rotated"
            }, {"unrelated": true}, "The system shall log out idle users."]}
            ```"#,
            "a.txt",
        )
        .unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].requirement_type, RequirementType::NonFunctional);
        assert_eq!(reqs[0].priority, Priority::Medium);
        assert_eq!(reqs[0].acceptance_criteria.len(), 2);
        assert_eq!(reqs[1].title, "The system shall log out idle users.");
    }

    #[tokio::test]
    async fn test_extracts_from_prose_wrapped_response() {
        let response = format!(
            "Here are the requirements:\n{}\nHope this helps.",
            extraction_response(serde_json::json!([{"description": "Encrypt data at rest"}]))
        );
        let stage = extractor(ScriptedModel::new(vec![Ok(response)]));
        let success = stage
            .run(&state_with_text("Encrypt data at rest."), None)
            .await
            .unwrap();
        match success.output {
            StageOutput::Requirements(reqs) => {
                assert_eq!(reqs.len(), 1);
                assert_eq!(reqs[0].id, "REQ-SECURITY-001");
                assert_eq!(reqs[0].source_document, "security.txt");
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_response_carries_raw_output() {
        let stage = extractor(ScriptedModel::new(vec![Ok("I cannot help with that.".into())]));
        let failure = stage.run(&state_with_text("text"), None).await.unwrap_err();
        assert_eq!(failure.error.label(), "ExtractionError");
        assert_eq!(
            failure.call_outputs.get("security.txt#1").map(String::as_str),
            Some("I cannot help with that.")
        );
        assert!(!failure.error.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_extraction_fails() {
        let stage = extractor(ScriptedModel::new(vec![Ok(r#"{"requirements": []}"#.into())]));
        let failure = stage.run(&state_with_text("text"), None).await.unwrap_err();
        assert!(failure.error.to_string().contains("no requirements"));
    }

    #[tokio::test]
    async fn test_model_error_propagates_kind() {
        let stage = extractor(ScriptedModel::new(vec![Err(CaseforgeError::model(
            ModelErrorKind::Auth,
            "401",
        ))]));
        let failure = stage.run(&state_with_text("text"), None).await.unwrap_err();
        assert!(failure.error.is_fatal());
    }

    #[tokio::test]
    async fn test_retry_hint_reaches_prompt() {
        let model = ScriptedModel::new(vec![Ok(extraction_response(
            serde_json::json!([{"description": "x"}]),
        ))]);
        let stats = model.stats();
        let hint = RetryHint {
            attempt: 1,
            previous_outputs: [("security.txt#1".to_string(), "garbage".to_string())]
                .into_iter()
                .collect(),
            issue: "no payload".into(),
            ..RetryHint::default()
        };
        extractor(model)
            .run(&state_with_text("text"), Some(&hint))
            .await
            .unwrap();
        assert!(stats.prompts()[0].contains("garbage"));
    }

    #[tokio::test]
    async fn test_concurrent_segments_keep_document_order() {
        let state = state_with_docs(&[
            ("a.txt", "Records are encrypted."),
            ("b.txt", "Access is audited."),
            ("c.txt", "Idle sessions lock.\n\nSummaries are exported."),
        ]);
        let stage = RequirementExtractor::new(Arc::new(SlowFirstModel), Duration::from_secs(5), 25, 4);
        let reqs = requirements_of(stage.run(&state, None).await);

        let ids: Vec<&str> = reqs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["REQ-A-001", "REQ-B-001", "REQ-C-001", "REQ-C-002"]);
        assert_eq!(reqs[0].description, "Encrypt patient records at rest");
        assert_eq!(reqs[3].description, "Export discharge summaries as signed PDF files");
    }

    #[tokio::test]
    async fn test_retry_echoes_each_segment_its_own_output() {
        let model = ScriptedModel::from_fn(|prompt| {
            if prompt.contains("Document: a.txt") {
                Ok("A-garbage".into())
            } else {
                Ok("B-garbage".into())
            }
        });
        let stats = model.stats();
        let stage = extractor(model);
        let state = state_with_docs(&[("a.txt", "First."), ("b.txt", "Second.")]);

        let failure = stage.run(&state, None).await.unwrap_err();
        assert_eq!(failure.call_outputs.len(), 2);
        let hint = RetryHint::from_failure(1, failure);
        let _ = stage.run(&state, Some(&hint)).await;

        let prompts = stats.prompts();
        let retry_b = prompts
            .iter()
            .skip(2)
            .find(|p| p.contains("Document: b.txt"))
            .unwrap();
        assert!(retry_b.contains("B-garbage"));
        assert!(!retry_b.contains("A-garbage"));
    }

    #[tokio::test]
    async fn test_near_duplicate_requirements_dropped() {
        let response = extraction_response(serde_json::json!([
            {"description": "The system shall encrypt all patient data at rest"},
            {"description": "The system shall encrypt all patient data at rest using"},
            {"description": "Audit logs are kept for six years"}
        ]));
        let stage = extractor(ScriptedModel::new(vec![Ok(response)]));
        let reqs = requirements_of(stage.run(&state_with_text("text"), None).await);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].description, "Audit logs are kept for six years");
    }

    #[test]
    fn test_bracketed_prose_before_requirements() {
        let reqs = parse_requirements(
            "Per section [3.2] of the policy:\n{\"requirements\": [{\"description\": \"Encrypt data\"}]}",
            "a.txt",
        )
        .unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].description, "Encrypt data");
    }
}
