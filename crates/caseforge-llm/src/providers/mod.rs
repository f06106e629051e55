pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::time::Duration;

use reqwest::StatusCode;

use caseforge_core::config::ModelConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};

/// Map a non-success HTTP status onto the model error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> CaseforgeError {
    let kind = match status.as_u16() {
        401 | 403 => ModelErrorKind::Auth,
        429 => ModelErrorKind::QuotaExceeded,
        408 | 504 => ModelErrorKind::Timeout,
        _ => ModelErrorKind::Unknown,
    };
    CaseforgeError::model(kind, format!("HTTP {}: {}", status, truncate(body, 500)))
}

pub(crate) fn transport_error(e: reqwest::Error) -> CaseforgeError {
    let kind = if e.is_timeout() {
        ModelErrorKind::Timeout
    } else {
        ModelErrorKind::Unknown
    };
    CaseforgeError::model(kind, e.to_string())
}

pub(crate) fn timeout_error(timeout: Duration) -> CaseforgeError {
    CaseforgeError::model(
        ModelErrorKind::Timeout,
        format!("no response within {}s", timeout.as_secs()),
    )
}

pub(crate) fn require_key<'a>(config: &'a ModelConfig, provider: &str) -> Result<&'a str> {
    config.api_key.as_deref().ok_or_else(|| {
        CaseforgeError::model(
            ModelErrorKind::Auth,
            format!("{}: api_key is required", provider),
        )
    })
}

/// Tighter of the request and configured timeouts.
pub(crate) fn effective_timeout(config: &ModelConfig, requested: Duration) -> Duration {
    requested.min(Duration::from_secs(config.timeout_secs.max(1)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let kind = |code: u16| match status_error(StatusCode::from_u16(code).unwrap(), "") {
            CaseforgeError::Model { kind, .. } => kind,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(kind(401), ModelErrorKind::Auth);
        assert_eq!(kind(403), ModelErrorKind::Auth);
        assert_eq!(kind(429), ModelErrorKind::QuotaExceeded);
        assert_eq!(kind(504), ModelErrorKind::Timeout);
        assert_eq!(kind(500), ModelErrorKind::Unknown);
    }

    #[test]
    fn test_missing_key_is_auth() {
        let config = caseforge_core::AppConfig::for_model("anthropic", "m").model;
        let err = require_key(&config, "Anthropic").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
