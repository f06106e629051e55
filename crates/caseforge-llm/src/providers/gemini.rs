use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use caseforge_core::config::ModelConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};
use caseforge_core::traits::{ModelClient, ModelRequest};

use super::{effective_timeout, require_key, status_error, timeout_error, transport_error};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    http: Client,
    config: ModelConfig,
    label: String,
}

impl GeminiClient {
    pub fn new(config: ModelConfig) -> Self {
        let label = format!("{}/{}", config.provider, config.model_id);
        Self {
            http: Client::new(),
            config,
            label,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

fn text_content(role: Option<&str>, text: String) -> GeminiContent {
    GeminiContent {
        role: role.map(str::to_string),
        parts: vec![GeminiPart { text }],
    }
}

impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        &self.label
    }

    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let config = &self.config;
            let api_key = require_key(config, "Gemini")?;
            let base = config.base_url.as_deref().unwrap_or(GEMINI_API_BASE);
            let url = format!("{}/{}:generateContent", base, config.model_id);

            let body = GeminiRequest {
                contents: vec![text_content(Some("user"), request.prompt)],
                system_instruction: request.system.map(|s| text_content(None, s)),
                generation_config: GenerationConfig {
                    max_output_tokens: config.max_tokens,
                    temperature: config.temperature,
                },
            };

            let req = self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .header("x-goog-api-key", api_key)
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

            let parsed: GeminiResponse = response.json().await.map_err(transport_error)?;
            let text: String = parsed
                .candidates
                .into_iter()
                .next()
                .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
                .unwrap_or_default();
            if text.is_empty() {
                return Err(CaseforgeError::model(
                    ModelErrorKind::Unknown,
                    "response had no candidates",
                ));
            }
            debug!(model = %self.label, chars = text.len(), "Model response received");
            Ok(text)
        })
    }
}
