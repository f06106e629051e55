use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class reported by the model capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    QuotaExceeded,
    Timeout,
    Auth,
    Unknown,
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Failure class reported by the document-text capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    UnsupportedFormat,
    Corrupt,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat => f.write_str("unsupported_format"),
            Self::Corrupt => f.write_str("corrupt"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaseforgeError {
    // Stage errors
    #[error("Parse error ({kind}) in {filename}: {message}")]
    Parse {
        kind: ParseErrorKind,
        filename: String,
        message: String,
    },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Capability errors
    #[error("Model error ({kind}): {message}")]
    Model { kind: ModelErrorKind, message: String },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Run control
    #[error("Run cancelled")]
    Cancelled,

    #[error("Too many concurrent sessions (limit {0})")]
    Busy(usize),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaseforgeError {
    pub fn model(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self::Model {
            kind,
            message: message.into(),
        }
    }

    /// Fatal errors skip stage retry and go straight to routing.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Model { kind, .. } => *kind == ModelErrorKind::Auth,
            Self::Parse { .. } | Self::Config(_) | Self::ConfigNotFound(_) | Self::Cancelled => true,
            Self::Extraction(_)
            | Self::Mapping(_)
            | Self::Generation(_)
            | Self::Validation(_) => false,
            Self::Persistence(_)
            | Self::SessionNotFound(_)
            | Self::Busy(_)
            | Self::Io(_)
            | Self::Json(_) => true,
        }
    }

    /// Short taxonomy label used in error log entries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "ParseError",
            Self::Extraction(_) => "ExtractionError",
            Self::Mapping(_) => "MappingError",
            Self::Generation(_) => "GenerationError",
            Self::Validation(_) => "ValidationError",
            Self::Model { .. } => "ModelError",
            Self::Persistence(_) | Self::SessionNotFound(_) => "PersistenceError",
            Self::Config(_) | Self::ConfigNotFound(_) => "ConfigError",
            Self::Cancelled => "Cancelled",
            Self::Busy(_) => "Busy",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }
}

pub type Result<T> = std::result::Result<T, CaseforgeError>;
