use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use caseforge_core::config::ModelConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};
use caseforge_core::traits::{ModelClient, ModelRequest};

use super::{effective_timeout, require_key, status_error, timeout_error, transport_error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
    label: String,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        let label = format!("{}/{}", config.provider, config.model_id);
        Self {
            http: Client::new(),
            config,
            label,
        }
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.label
    }

    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let config = &self.config;
            let api_key = require_key(config, "Anthropic")?;
            let url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                messages: vec![ApiMessage {
                    role: "user",
                    content: request.prompt,
                }],
                system: request.system,
            };

            let req = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body);

            let timeout = effective_timeout(config, request.timeout);
            let response = tokio::time::timeout(timeout, req.send())
                .await
                .map_err(|_| timeout_error(timeout))?
                .map_err(transport_error)?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(status_error(status, &body));
            }

            let parsed: AnthropicResponse = response.json().await.map_err(transport_error)?;
            let text: String = parsed
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text),
                    ContentBlock::Other => None,
                })
                .collect();
            if text.is_empty() {
                return Err(CaseforgeError::model(
                    ModelErrorKind::Unknown,
                    "response had no text content",
                ));
            }
            debug!(model = %self.label, chars = text.len(), "Model response received");
            Ok(text)
        })
    }
}
