use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use caseforge_core::error::CaseforgeError;
use caseforge_core::traits::{ModelClient, ModelRequest};
use caseforge_core::types::{
    ComplianceMappings, ComplianceStandard, Requirement, StageKind, StateRecord,
};

use crate::json::{extract_payload, str_field, str_list};
use crate::prompts;
use crate::stage::{RetryHint, Stage, StageFailure, StageOutput, StageResult, StageSuccess};

/// Tags requirements with the healthcare standards that apply to them.
///
/// Best effort: unknown tags are dropped, and once retries run out the
/// engine falls back to [`keyword_mappings`].
pub struct ComplianceMapper {
    model: Arc<dyn ModelClient>,
    timeout: Duration,
}

impl ComplianceMapper {
    pub fn new(model: Arc<dyn ModelClient>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    async fn map(&self, state: &StateRecord, hint: Option<&RetryHint>) -> StageResult {
        let standards = state.effective_standards();
        let prompt = prompts::with_retry_hint(
            prompts::compliance(&state.requirements, &standards),
            hint,
            None,
        );
        let request = ModelRequest::new(prompt, self.timeout).with_system(prompts::SYSTEM_PROMPT);
        let text = self.model.generate(request).await?;

        let Some(parsed) = parse_mappings(&text, &state.requirements, &standards) else {
            return Err(StageFailure::with_output(
                CaseforgeError::Mapping("response did not contain a mappings payload".into()),
                text,
            ));
        };

        info!(
            mapped = parsed.mappings.len(),
            requirements = state.requirements.len(),
            "Compliance mapping complete"
        );
        Ok(StageSuccess::new(StageOutput::Mappings {
            mappings: parsed.mappings,
            rationale: parsed.rationale,
        })
        .with_notes(parsed.notes))
    }
}

impl Stage for ComplianceMapper {
    fn kind(&self) -> StageKind {
        StageKind::ComplianceMapper
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(self.map(state, hint))
    }

    fn degrade(&self, state: &StateRecord) -> Option<StageSuccess> {
        let mappings = keyword_mappings(&state.requirements, &state.effective_standards());
        Some(
            StageSuccess::new(StageOutput::Mappings {
                mappings,
                rationale: BTreeMap::new(),
            })
            .with_notes(vec!["Compliance tags derived from keyword matching".into()]),
        )
    }
}

pub struct ParsedMappings {
    pub mappings: ComplianceMappings,
    pub rationale: BTreeMap<String, String>,
    pub notes: Vec<String>,
}

struct MappingEntry {
    requirement_id: String,
    tags: Vec<String>,
    rationale: Option<String>,
}

/// Parse a mapping response, keeping only known requirement ids and allowed
/// standards. `None` when no payload is found or no entry names a known
/// requirement.
pub fn parse_mappings(
    text: &str,
    requirements: &[Requirement],
    allowed: &[ComplianceStandard],
) -> Option<ParsedMappings> {
    let payload = extract_payload(text, "mappings")?;
    let entries = mapping_entries(&payload)?;

    let known: BTreeSet<&str> = requirements.iter().map(|r| r.id.as_str()).collect();
    if !entries
        .iter()
        .any(|e| known.contains(e.requirement_id.as_str()))
    {
        return None;
    }

    let mut mappings: ComplianceMappings = BTreeMap::new();
    let mut rationale = BTreeMap::new();
    let mut notes = Vec::new();

    for entry in entries {
        let requirement_id = entry.requirement_id;
        if !known.contains(requirement_id.as_str()) {
            warn!(requirement_id = %requirement_id, "Dropping mapping for unknown requirement");
            notes.push(format!("Dropped mapping for unknown requirement {}", requirement_id));
            continue;
        }
        for tag in entry.tags {
            match ComplianceStandard::parse(&tag) {
                Some(standard) if allowed.contains(&standard) => {
                    mappings
                        .entry(requirement_id.clone())
                        .or_default()
                        .insert(standard);
                }
                Some(standard) => {
                    warn!(requirement_id = %requirement_id, standard = %standard, "Dropping standard outside the requested set");
                }
                None => {
                    warn!(requirement_id = %requirement_id, tag = %tag, "Dropping unrecognized compliance tag");
                    notes.push(format!(
                        "Dropped unrecognized compliance tag '{}' on {}",
                        tag, requirement_id
                    ));
                }
            }
        }
        if let Some(reason) = entry.rationale {
            if mappings.contains_key(&requirement_id) {
                rationale.insert(requirement_id, reason);
            }
        }
    }

    Some(ParsedMappings {
        mappings,
        rationale,
        notes,
    })
}

/// Accepts `{"mappings": [{"requirement_id", "standards", "rationale"}]}`, a
/// bare list of such entries, or a plain `{"REQ-1": ["HIPAA"]}` object.
fn mapping_entries(payload: &Value) -> Option<Vec<MappingEntry>> {
    let list = match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("mappings").and_then(Value::as_array),
        _ => None,
    };

    if let Some(items) = list {
        return Some(
            items
                .iter()
                .filter_map(|item| {
                    let id = str_field(item, &["requirement_id", "id", "requirement"])?;
                    Some(MappingEntry {
                        requirement_id: id.to_string(),
                        tags: str_list(item, &["standards", "compliance_standards", "tags"]),
                        rationale: str_field(item, &["rationale", "reason", "evidence"])
                            .map(str::to_string),
                    })
                })
                .collect(),
        );
    }

    let map = payload.as_object()?;
    if map.contains_key("mappings") {
        // "mappings" present but not a list
        let inner = map.get("mappings")?.as_object()?;
        return Some(object_entries(inner));
    }
    Some(object_entries(map))
}

fn object_entries(map: &serde_json::Map<String, Value>) -> Vec<MappingEntry> {
    map.iter()
        .filter_map(|(id, tags)| {
            let tags = match tags {
                Value::Array(values) => values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::String(s) => vec![s.clone()],
                _ => return None,
            };
            Some(MappingEntry {
                requirement_id: id.clone(),
                tags,
                rationale: None,
            })
        })
        .collect()
}

/// One case-insensitive pattern per standard matching any of its keywords at
/// the start of a word, so "encrypt" finds "encryption" but "phi" skips
/// "graphic".
fn keyword_patterns() -> &'static [(ComplianceStandard, Regex)] {
    static PATTERNS: OnceLock<Vec<(ComplianceStandard, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ComplianceStandard::ALL
            .iter()
            .filter_map(|standard| {
                let alternatives = standard
                    .keywords()
                    .iter()
                    .map(|k| regex::escape(k))
                    .collect::<Vec<_>>()
                    .join("|");
                Regex::new(&format!(r"(?i)\b(?:{})", alternatives))
                    .ok()
                    .map(|re| (*standard, re))
            })
            .collect()
    })
}

/// Tag each requirement with every allowed standard whose keywords appear in it.
pub fn keyword_mappings(
    requirements: &[Requirement],
    allowed: &[ComplianceStandard],
) -> ComplianceMappings {
    let mut mappings: ComplianceMappings = BTreeMap::new();
    for req in requirements {
        let text = format!(
            "{} {} {}",
            req.title,
            req.description,
            req.acceptance_criteria.join(" ")
        );
        let tags: BTreeSet<ComplianceStandard> = keyword_patterns()
            .iter()
            .filter(|(standard, re)| allowed.contains(standard) && re.is_match(&text))
            .map(|(standard, _)| *standard)
            .collect();
        if !tags.is_empty() {
            mappings.insert(req.id.clone(), tags);
        }
    }
    mappings
}
