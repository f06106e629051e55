use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use caseforge_core::config::RetryConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};
use caseforge_core::traits::{ModelClient, ModelRequest};

/// A model client that retries transient failures and falls back to alternative providers.
///
/// This is transport-level retry only. Stage-level retry (re-prompting after
/// unparseable output) is the workflow router's job.
pub struct RetryingClient {
    primary: Box<dyn ModelClient>,
    fallbacks: Vec<Box<dyn ModelClient>>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn ModelClient>,
        fallbacks: Vec<Box<dyn ModelClient>>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn is_retryable(e: &CaseforgeError) -> bool {
    matches!(
        e,
        CaseforgeError::Model {
            kind: ModelErrorKind::QuotaExceeded | ModelErrorKind::Timeout,
            ..
        }
    )
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ModelClient for RetryingClient {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.generate(request.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying model request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Primary exhausted, try fallbacks
            if !self.fallbacks.is_empty() {
                info!(primary = %self.primary.name(), "Primary model exhausted, trying fallback models");
            }
            for fallback in &self.fallbacks {
                match fallback.generate(request.clone()).await {
                    Ok(text) => {
                        info!(model = %fallback.name(), "Fell back to alternative model");
                        return Ok(text);
                    }
                    Err(e) => {
                        warn!(model = %fallback.name(), error = %e, "Fallback model also failed");
                        continue;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| {
                CaseforgeError::model(ModelErrorKind::Unknown, "All providers failed")
            }))
        })
    }
}
