use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{InputDocument, SessionId, SessionSummary, StateRecord};

/// One text-in, text-out request to the model capability.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Upper bound for the whole exchange; exceeding it is a `timeout` model error.
    pub timeout: Duration,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            timeout,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Model capability: `generate(prompt) -> text`, failing with a `Model` error.
pub trait ModelClient: Send + Sync + 'static {
    /// Provider/model label for logging.
    fn name(&self) -> &str;

    /// Send a request and wait for the complete response text.
    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>>;
}

/// Document-text capability: raw bytes in, plain text out, or a `Parse` error.
pub trait DocumentTextExtractor: Send + Sync + 'static {
    fn extract_text(&self, document: &InputDocument) -> Result<String>;
}

/// Persistence backend for state records.
pub trait SessionStore: Send + Sync + 'static {
    /// Insert or replace the record under its session id.
    fn save(&self, state: &StateRecord) -> BoxFuture<'_, Result<()>>;

    /// Load a record; `SessionNotFound` when absent.
    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<StateRecord>>;

    /// Summaries of all stored sessions, most recently updated first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<SessionSummary>>>;

    /// Delete a session. Returns whether it existed.
    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>>;

    /// Evict sessions last updated before `cutoff`. Returns how many were removed.
    fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<usize>>;
}
