use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use caseforge_core::config::ModelConfig;
use caseforge_core::error::{CaseforgeError, ModelErrorKind, Result};
use caseforge_core::traits::{ModelClient, ModelRequest};

use super::{effective_timeout, status_error, timeout_error, transport_error};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completions client (OpenAI, Azure proxies, Ollama, vLLM, ...).
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
    label: String,
}

impl OpenAiClient {
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
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.label
    }

    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let config = &self.config;
            let url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let mut messages = Vec::with_capacity(2);
            if let Some(system) = request.system {
                messages.push(OaiMessage {
                    role: "system",
                    content: system,
                });
            }
            messages.push(OaiMessage {
                role: "user",
                content: request.prompt,
            });

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages,
                max_tokens: config.max_tokens,
                temperature: Some(config.temperature),
            };

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

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

            let parsed: ChatResponse = response.json().await.map_err(transport_error)?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| {
                    CaseforgeError::model(ModelErrorKind::Unknown, "response had no content")
                })?;
            debug!(model = %self.label, chars = text.len(), "Model response received");
            Ok(text)
        })
    }
}
