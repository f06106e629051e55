use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use caseforge_core::error::{CaseforgeError, ParseErrorKind};
use caseforge_core::traits::DocumentTextExtractor;
use caseforge_core::types::{DocumentFormat, ParsedDocument, StageKind, StateRecord};

use crate::stage::{RetryHint, Stage, StageFailure, StageOutput, StageResult, StageSuccess};

/// Decodes every input document, skipping (and noting) the ones that fail.
pub struct DocumentParser {
    extractor: Arc<dyn DocumentTextExtractor>,
}

impl DocumentParser {
    pub fn new(extractor: Arc<dyn DocumentTextExtractor>) -> Self {
        Self { extractor }
    }

    fn parse_all(&self, state: &StateRecord) -> StageResult {
        let documents = state.input_documents();
        if documents.is_empty() {
            return Err(StageFailure::new(CaseforgeError::Parse {
                kind: ParseErrorKind::Corrupt,
                filename: String::new(),
                message: "document batch is empty".into(),
            }));
        }

        let mut parsed = Vec::with_capacity(documents.len());
        let mut failures = Vec::new();

        for doc in documents {
            match self.extractor.extract_text(doc) {
                Ok(text) if text.trim().is_empty() => {
                    warn!(filename = %doc.filename, "Skipping document with no text");
                    failures.push(CaseforgeError::Parse {
                        kind: ParseErrorKind::Corrupt,
                        filename: doc.filename.clone(),
                        message: "document contains no text".into(),
                    });
                }
                Ok(text) => {
                    let word_count = text.split_whitespace().count();
                    debug!(filename = %doc.filename, word_count, "Parsed document");
                    parsed.push(ParsedDocument {
                        filename: doc.filename.clone(),
                        format: DocumentFormat::from_filename(&doc.filename),
                        size_bytes: doc.content.len(),
                        word_count,
                        text,
                    });
                }
                Err(e) => {
                    warn!(filename = %doc.filename, error = %e, "Skipping unreadable document");
                    failures.push(e);
                }
            }
        }

        if parsed.is_empty() {
            let summary = failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            let error = match failures.into_iter().next() {
                Some(CaseforgeError::Parse { kind, filename, .. }) => CaseforgeError::Parse {
                    kind,
                    filename,
                    message: format!("no document could be parsed: {}", summary),
                },
                Some(other) => other,
                None => CaseforgeError::Parse {
                    kind: ParseErrorKind::Corrupt,
                    filename: String::new(),
                    message: "no document could be parsed".into(),
                },
            };
            return Err(StageFailure::new(error));
        }

        let notes = failures
            .iter()
            .map(|e| format!("Skipped document: {}", e))
            .collect();
        Ok(StageSuccess::new(StageOutput::Parsed(parsed)).with_notes(notes))
    }
}

impl Stage for DocumentParser {
    fn kind(&self) -> StageKind {
        StageKind::DocumentParser
    }

    fn run<'a>(
        &'a self,
        state: &'a StateRecord,
        _hint: Option<&'a RetryHint>,
    ) -> BoxFuture<'a, StageResult> {
        Box::pin(async move { self.parse_all(state) })
    }
}
