//! Shared test utilities: a scripted model client and healthcare fixtures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use caseforge_core::config::AppConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};
use caseforge_core::traits::{ModelClient, ModelRequest};
use caseforge_core::types::InputDocument;

type Responder = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Call counter and prompt log shared with the test after the model is boxed.
#[derive(Default)]
pub struct ScriptStats {
    prompts: Mutex<Vec<String>>,
}

impl ScriptStats {
    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Number of prompts containing `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .map(|p| p.iter().filter(|s| s.contains(needle)).count())
            .unwrap_or(0)
    }
}

/// Model client that replays canned responses.
///
/// Queued responses are consumed first; once the queue is empty the
/// responder closure (if any) answers based on the prompt text.
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<String>>>,
    responder: Option<Responder>,
    stats: Arc<ScriptStats>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            responder: None,
            stats: Arc::new(ScriptStats::default()),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            stats: Arc::new(ScriptStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        Arc::clone(&self.stats)
    }
}

impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted/test"
    }

    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if let Ok(mut prompts) = self.stats.prompts.lock() {
                prompts.push(request.prompt.clone());
            }
            let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
            match (queued, &self.responder) {
                (Some(response), _) => response,
                (None, Some(responder)) => responder(&request.prompt),
                (None, None) => Err(CaseforgeError::model(
                    ModelErrorKind::Unknown,
                    "scripted model has no more responses",
                )),
            }
        })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────

pub const ENCRYPTION_REQUIREMENT: &str =
    "The system shall encrypt all patient data at rest using AES-256.";

/// A one-line requirements document about encrypting patient data.
pub fn encryption_document() -> InputDocument {
    InputDocument::from_text("security_requirements.txt", ENCRYPTION_REQUIREMENT)
}

/// Config suitable for tests: no transport retry, no persistence paths.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::for_model("scripted", "test");
    config.workflow.max_retries = 2;
    config.session.enabled = false;
    config
}

pub fn extraction_response(requirements: serde_json::Value) -> String {
    serde_json::json!({ "requirements": requirements }).to_string()
}

pub fn mapping_response(mappings: serde_json::Value) -> String {
    serde_json::json!({ "mappings": mappings }).to_string()
}

pub fn generation_response(test_cases: serde_json::Value) -> String {
    serde_json::json!({ "test_cases": test_cases }).to_string()
}

/// Responder that plays a well-behaved model for the encryption document.
///
/// Dispatches on the `## Task:` heading each workflow prompt carries.
pub fn healthcare_responder(prompt: &str) -> Result<String> {
    if prompt.contains("## Task: requirement extraction") {
        Ok(extraction_response(serde_json::json!([{
            "id": "REQ-001",
            "title": "Encrypt patient data at rest",
            "description": ENCRYPTION_REQUIREMENT,
            "type": "security",
            "priority": "critical",
            "acceptance_criteria": ["Stored patient records are AES-256 encrypted"]
        }])))
    } else if prompt.contains("## Task: compliance mapping") {
        let id = first_requirement_id(prompt).unwrap_or_else(|| "REQ-001".into());
        Ok(mapping_response(serde_json::json!([{
            "requirement_id": id,
            "standards": ["HIPAA", "ISO 27001"]
        }])))
    } else if prompt.contains("## Task: test case generation") {
        let id = first_requirement_id(prompt).unwrap_or_else(|| "REQ-001".into());
        Ok(generation_response(serde_json::json!([
            {
                "requirement_id": id,
                "category": "positive",
                "title": "Patient record is stored encrypted",
                "description": "Verify that new patient records are encrypted at rest",
                "priority": "critical",
                "preconditions": ["Database is provisioned"],
                "steps": ["Create a patient record", "Inspect the stored bytes"],
                "expected_result": "Stored bytes are AES-256 ciphertext"
            },
            {
                "requirement_id": id,
                "category": "security",
                "title": "Raw storage access does not reveal PHI",
                "description": "Verify that reading the storage volume directly exposes no plaintext",
                "priority": "critical",
                "steps": ["Read the data file directly", "Search for known patient names"],
                "expected_result": "No plaintext patient data is found"
            }
        ])))
    } else {
        Err(CaseforgeError::model(
            ModelErrorKind::Unknown,
            "unrecognised prompt",
        ))
    }
}

/// First normalized requirement id (`REQ-...`) mentioned in a prompt.
pub fn first_requirement_id(prompt: &str) -> Option<String> {
    let start = prompt.find("REQ-")?;
    let id: String = prompt[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_requirement_id() {
        assert_eq!(
            first_requirement_id("ids: REQ-security-001, REQ-x-002").as_deref(),
            Some("REQ-security-001")
        );
        assert_eq!(first_requirement_id("nothing here"), None);
    }
}
