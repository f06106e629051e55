//! End-to-end runs of the workflow against a scripted model.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use caseforge_core::traits::SessionStore;
use caseforge_core::types::{
    ComplianceStandard, InputDocument, RunStatus, SessionId, StageKind, StateRecord, TestCategory,
};
use caseforge_pipeline::stages::finalizer::build_report;
use caseforge_pipeline::TestCaseGenerator;
use caseforge_store::{MemorySessionStore, SqliteSessionStore};
use caseforge_test_utils::{
    encryption_document, extraction_response, first_requirement_id, generation_response,
    healthcare_responder, test_config, ScriptedModel,
};

fn generator_with(
    model: ScriptedModel,
) -> (TestCaseGenerator, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let generator =
        TestCaseGenerator::new(test_config(), Arc::new(model)).with_store(store.clone());
    (generator, store)
}

async fn stored(store: &MemorySessionStore, id: &SessionId) -> StateRecord {
    store.load(id).await.expect("session stored")
}

#[tokio::test]
async fn test_encryption_requirement_yields_security_case() {
    let (generator, _) = generator_with(ScriptedModel::from_fn(healthcare_responder));
    let document = InputDocument::from_text(
        "records.txt",
        "The system shall encrypt patient records at rest.",
    );

    let result = generator
        .process_documents(vec![document], [])
        .await
        .expect("run completes");

    assert!(result.success);
    assert!(!result.requirements.is_empty());
    let req_id = &result.requirements[0].id;
    let tags = result
        .compliance_mappings
        .get(req_id)
        .expect("requirement is mapped");
    assert!(tags.contains(&ComplianceStandard::Hipaa));
    assert!(result
        .test_cases
        .iter()
        .any(|tc| tc.category == TestCategory::Security && &tc.requirement_id == req_id));
    assert!(result.quality_scores.is_some());
}

#[tokio::test]
async fn test_empty_batch_fails_without_output() {
    let (generator, store) = generator_with(ScriptedModel::from_fn(healthcare_responder));

    let result = generator
        .process_documents(vec![], [])
        .await
        .expect("run completes");

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.requirements.is_empty());
    assert!(result.test_cases.is_empty());
    assert!(result.errors.iter().any(|e| e.kind == "ParseError"));

    // A fatal parse error is never retried
    let state = stored(&store, &result.session_id).await;
    assert_eq!(state.retries(StageKind::DocumentParser), 0);
}

#[tokio::test]
async fn test_unreadable_document_is_skipped_in_a_batch() {
    let model = ScriptedModel::from_fn(|prompt| {
        if prompt.contains("## Task: requirement extraction")
            && prompt.contains("Document: audit.txt")
        {
            Ok(extraction_response(serde_json::json!([{
                "id": "REQ-002",
                "description": "Every chart access shall be written to the audit log",
                "type": "compliance",
                "priority": "high"
            }])))
        } else {
            healthcare_responder(prompt)
        }
    });
    let (generator, _) = generator_with(model);
    let documents = vec![
        encryption_document(),
        InputDocument::new("corrupt.txt", vec![0x52, 0xff, 0xfe, 0x45]),
        InputDocument::from_text(
            "audit.txt",
            "Every chart access shall be written to the audit log.",
        ),
    ];

    let result = generator
        .process_documents(documents, [])
        .await
        .expect("run completes");

    assert!(result.success);
    let sources: Vec<&str> = result
        .requirements
        .iter()
        .map(|r| r.source_document.as_str())
        .collect();
    assert_eq!(sources, vec!["security_requirements.txt", "audit.txt"]);
    assert!(result
        .test_cases
        .iter()
        .any(|tc| tc.requirement_id == "REQ-002"));
    assert!(result
        .errors
        .iter()
        .any(|e| e.stage == Some(StageKind::DocumentParser) && e.message.contains("corrupt.txt")));

    let report = result.report.as_ref().expect("report");
    assert_eq!(report.documents_received, 3);
    assert_eq!(report.documents_processed, 2);
}

#[tokio::test]
async fn test_unparseable_extraction_aborts_after_retries() {
    let model = ScriptedModel::from_fn(|_| Ok("I could not find any requirements, sorry.".into()));
    let stats = model.stats();
    let (generator, store) = generator_with(model);
    let max_retries = test_config().workflow.max_retries;

    let result = generator
        .process_documents(vec![encryption_document()], [])
        .await
        .expect("run completes");

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.test_cases.is_empty());
    assert!(result.errors.iter().any(|e| e.kind == "ExtractionError"));
    assert_eq!(stats.calls() as u32, max_retries + 1);

    let report = result.report.as_ref().expect("finalizer ran");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.requirements_extracted, 0);
    assert_eq!(report.test_cases_generated, 0);

    let state = stored(&store, &result.session_id).await;
    assert!(state.retry_counts.values().all(|&n| n <= max_retries));
    assert_eq!(state.retries(StageKind::RequirementExtractor), max_retries);
}

#[tokio::test]
async fn test_mapping_failure_degrades_instead_of_aborting() {
    let model = ScriptedModel::from_fn(|prompt| {
        if prompt.contains("## Task: compliance mapping") {
            Ok("mapping service is confused".into())
        } else {
            healthcare_responder(prompt)
        }
    });
    let (generator, store) = generator_with(model);

    let result = generator
        .process_documents(vec![encryption_document()], [])
        .await
        .expect("run completes");

    assert!(result.success);
    assert!(!result.test_cases.is_empty());
    let report = result.report.as_ref().expect("report");
    assert_eq!(report.degraded_stages, vec![StageKind::ComplianceMapper]);

    // Keyword fallback still tags the encryption requirement
    let req_id = &result.requirements[0].id;
    assert!(result.compliance_mappings[req_id].contains(&ComplianceStandard::Hipaa));

    let state = stored(&store, &result.session_id).await;
    assert_eq!(
        state.retries(StageKind::ComplianceMapper),
        test_config().workflow.max_retries
    );
}

#[tokio::test]
async fn test_refinalization_is_idempotent() {
    let (generator, store) = generator_with(ScriptedModel::from_fn(healthcare_responder));
    let result = generator
        .process_documents(vec![encryption_document()], [ComplianceStandard::Hipaa])
        .await
        .expect("run completes");

    let state = stored(&store, &result.session_id).await;
    let report = state.report.clone().expect("report");
    assert_eq!(build_report(&state), report);
    assert_eq!(build_report(&state), build_report(&state));
}

#[tokio::test]
async fn test_dangling_test_case_references_dropped() {
    let model = ScriptedModel::from_fn(|prompt| {
        if prompt.contains("## Task: test case generation") {
            let id = first_requirement_id(prompt).unwrap_or_default();
            Ok(generation_response(serde_json::json!([
                {
                    "requirement_id": id,
                    "category": "security",
                    "title": "Ciphertext at rest",
                    "description": "Stored records are encrypted",
                    "steps": ["Store a record", "Read raw bytes"],
                    "expected_result": "Only ciphertext is visible"
                },
                {
                    "requirement_id": "REQ-GHOST-404",
                    "category": "positive",
                    "title": "Orphan",
                    "description": "Refers to nothing",
                    "steps": ["Do nothing"],
                    "expected_result": "Nothing"
                }
            ])))
        } else {
            healthcare_responder(prompt)
        }
    });
    let (generator, _) = generator_with(model);

    let result = generator
        .process_documents(vec![encryption_document()], [])
        .await
        .expect("run completes");

    let ids: Vec<&str> = result.requirements.iter().map(|r| r.id.as_str()).collect();
    assert!(!result.test_cases.is_empty());
    for tc in &result.test_cases {
        assert!(ids.contains(&tc.requirement_id.as_str()));
    }
    for key in result.compliance_mappings.keys() {
        assert!(ids.contains(&key.as_str()));
    }
}

#[tokio::test]
async fn test_interrupted_session_resumes_from_sqlite() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(SqliteSessionStore::open(&dir.path().join("sessions.db")).expect("open"));

    // A session interrupted before its first stage
    let mut pending = StateRecord::new(vec![encryption_document()], [ComplianceStandard::Hipaa]);
    pending.current_stage = Some(StageKind::DocumentParser);
    store.save(&pending).await.expect("save");

    let generator = TestCaseGenerator::new(
        test_config(),
        Arc::new(ScriptedModel::from_fn(healthcare_responder)),
    )
    .with_store(store.clone());

    let result = generator
        .resume(pending.session_id(), &CancellationToken::new())
        .await
        .expect("resume");
    assert!(result.success);
    assert_eq!(&result.session_id, pending.session_id());

    let summary = generator
        .session_status(pending.session_id())
        .await
        .expect("status");
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.test_cases > 0);

    let err = generator
        .resume(&SessionId::from_str("missing"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"));
}
