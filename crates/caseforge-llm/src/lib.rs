pub mod providers;
pub mod retry;

use caseforge_core::config::AppConfig;
use caseforge_core::config::ModelConfig;
use caseforge_core::traits::ModelClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::gemini::GeminiClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn ModelClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new(config.clone())),
        "gemini" | "google" => Box::new(GeminiClient::new(config.clone())),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new(config.clone())),
    }
}

/// Primary model plus configured fallbacks, wrapped in transport retry.
pub fn create_retrying_client(config: &AppConfig) -> RetryingClient {
    let fallbacks = config.fallback_models.iter().map(create_client).collect();
    RetryingClient::new(
        create_client(&config.model),
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client_by_provider() {
        let mut config = AppConfig::for_model("anthropic", "claude-sonnet-4");
        assert_eq!(create_client(&config.model).name(), "anthropic/claude-sonnet-4");

        config.model.provider = "gemini".into();
        config.model.model_id = "gemini-2.0-flash".into();
        assert_eq!(create_client(&config.model).name(), "gemini/gemini-2.0-flash");

        config.model.provider = "ollama".into();
        config.model.model_id = "llama3".into();
        assert_eq!(create_client(&config.model).name(), "ollama/llama3");
    }
}
