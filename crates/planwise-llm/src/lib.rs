pub mod providers;
pub mod retry;
pub mod streaming;

use planwise_core::config::ModelConfig;
use planwise_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Create the primary client wrapped with retries and any fallback models.
pub fn create_retrying_client(
    primary: &ModelConfig,
    fallbacks: &[ModelConfig],
) -> RetryingClient {
    let fallback_clients = fallbacks
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    RetryingClient::new(
        create_client(primary),
        fallback_clients,
        primary.retry.clone().unwrap_or_default(),
    )
}
