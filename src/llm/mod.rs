mod ollama;
mod openai;

use crate::types::MessageRole;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

pub use ollama::{list_local_models, OllamaProvider};
pub use openai::OpenAiProvider;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Incremental text chunks of one reply
pub type TextStream = BoxStream<'static, LlmResult<String>>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Response parsing failed: {0}")]
    ParseError(String),
}

/// One prior turn of the conversation, from the model's point of view
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request for one model reply
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Persona or task instructions
    pub system_prompt: Option<String>,
    /// Conversation so far, oldest first; the last turn is what gets answered
    pub history: Vec<ChatTurn>,
    pub temperature: Option<f32>,
    /// Maximum response length in tokens (provider-dependent)
    pub max_tokens: Option<u32>,
    /// Timeout for the request (for streams: until the first byte)
    pub timeout: Duration,
    /// Optional model override (e.g., "gpt-4o" instead of configured model)
    pub model_override: Option<String>,
}

impl GenerateRequest {
    pub fn new(history: Vec<ChatTurn>, timeout: Duration) -> Self {
        Self {
            system_prompt: None,
            history,
            temperature: None,
            max_tokens: None,
            timeout,
            model_override: None,
        }
    }
}

/// Response from an LLM provider
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// The generated text
    pub text: String,
    /// Provider-specific metadata (model used, tokens consumed, etc.)
    pub metadata: ResponseMetadata,
}

/// Metadata about the LLM response
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    /// Name of the provider (e.g., "openai", "ollama")
    pub provider: String,
    /// Model name used
    pub model: String,
    /// Tokens consumed (if available)
    pub tokens_used: Option<u32>,
    /// Latency in milliseconds
    pub latency_ms: u64,
}

/// Trait that all LLM providers must implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a complete reply
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse>;

    /// Stream a reply chunk by chunk. Providers without native streaming
    /// yield the whole reply as one chunk.
    async fn stream(&self, request: GenerateRequest) -> LlmResult<TextStream> {
        let response = self.generate(request).await?;
        Ok(futures::stream::once(async move { Ok(response.text) }).boxed())
    }

    /// Get the name of this provider
    fn name(&self) -> &str;

    /// Model used when a request carries no override
    fn default_model(&self) -> &str;
}

/// Manager for multiple LLM providers
pub struct LlmManager {
    pub providers: Vec<Box<dyn LlmProvider>>,
}

impl LlmManager {
    /// Create a new LLM manager with the given providers
    pub fn new(providers: Vec<Box<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    /// The configured model of every provider, as `provider:model`
    pub fn model_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| format!("{}:{}", p.name(), p.default_model()))
            .collect()
    }

    /// Generate from all providers concurrently.
    /// Returns (model_id, response) pairs for successful generations.
    pub async fn generate_from_all(
        &self,
        request: GenerateRequest,
    ) -> Vec<(String, GenerateResponse)> {
        let tasks = self.providers.iter().map(|provider| {
            let req = request.clone();
            let model_id = format!("{}:{}", provider.name(), provider.default_model());
            let provider_ref = provider.as_ref();
            async move {
                match provider_ref.generate(req).await {
                    Ok(response) => Some((model_id, response)),
                    Err(e) => {
                        tracing::error!("Provider {} failed: {}", model_id, e);
                        None
                    }
                }
            }
        });

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Look up the provider for a model id.
    /// model_id format: "provider:model" (e.g., "openai:gpt-4o", "ollama:llama3.2")
    fn resolve(&self, model_id: &str) -> LlmResult<(&dyn LlmProvider, String)> {
        let (provider_name, model_name) = model_id.split_once(':').ok_or_else(|| {
            LlmError::ConfigError(
                "Invalid model ID format, expected 'provider:model'".to_string(),
            )
        })?;

        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == provider_name)
            .ok_or_else(|| {
                LlmError::ConfigError(format!("Provider '{}' not configured", provider_name))
            })?;

        Ok((provider.as_ref(), model_name.to_string()))
    }

    /// Generate from a specific provider with the model from `model_id`
    pub async fn generate_from_model(
        &self,
        model_id: &str,
        request: GenerateRequest,
    ) -> LlmResult<GenerateResponse> {
        let (provider, model) = self.resolve(model_id)?;
        provider
            .generate(GenerateRequest {
                model_override: Some(model),
                ..request
            })
            .await
    }

    /// Stream from a specific provider with the model from `model_id`
    pub async fn stream_from_model(
        &self,
        model_id: &str,
        request: GenerateRequest,
    ) -> LlmResult<TextStream> {
        let (provider, model) = self.resolve(model_id)?;
        tracing::debug!("Streaming reply from {}", model_id);
        provider
            .stream(GenerateRequest {
                model_override: Some(model),
                ..request
            })
            .await
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// Base URL for OpenAI-compatible endpoints (ModelScope, vLLM, ...)
    pub openai_base_url: Option<String>,
    /// OpenAI model to use
    pub openai_model: String,
    /// Ollama base URL
    pub ollama_base_url: Option<String>,
    /// Ollama model to use
    pub ollama_model: String,
    /// Default timeout for LLM requests
    pub default_timeout: Duration,
    /// Default max tokens for chat replies
    pub default_max_tokens: u32,
    /// Sampling temperature for chat replies
    pub default_temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: None,
            openai_model: "gpt-4o-mini".to_string(),
            ollama_base_url: Some("http://localhost:11434".to_string()),
            ollama_model: "llama3.2".to_string(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 250,
            default_temperature: 0.8,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ollama_base_url = match std::env::var("OLLAMA_BASE_URL") {
            Ok(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => defaults.ollama_base_url,
        };

        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_base_url: non_empty_env("OPENAI_BASE_URL"),
            openai_model: non_empty_env("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            ollama_base_url,
            ollama_model: non_empty_env("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            default_timeout: std::env::var("LLM_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            default_max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_max_tokens),
            default_temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|t: &f32| (0.0..=2.0).contains(t))
                .unwrap_or(defaults.default_temperature),
        }
    }

    /// Build an LlmManager with all configured providers
    pub fn build_manager(&self) -> LlmResult<LlmManager> {
        let mut providers: Vec<Box<dyn LlmProvider>> = Vec::new();

        // Add OpenAI if API key is available
        if let Some(api_key) = &self.openai_api_key {
            providers.push(Box::new(OpenAiProvider::new(
                api_key.clone(),
                self.openai_base_url.clone(),
                self.openai_model.clone(),
            )));
        }

        // Add Ollama if base URL is available
        if let Some(base_url) = &self.ollama_base_url {
            providers.push(Box::new(OllamaProvider::new(
                base_url.clone(),
                self.ollama_model.clone(),
            )?));
        }

        if providers.is_empty() {
            return Err(LlmError::ConfigError(
                "No LLM providers configured. Set OPENAI_API_KEY or OLLAMA_BASE_URL".to_string(),
            ));
        }

        Ok(LlmManager::new(providers))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = LlmConfig::default();
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.ollama_model, "llama3.2");
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.default_max_tokens, 250);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("OPENAI_API_KEY", "  sk-test ");
        std::env::set_var("OPENAI_BASE_URL", "https://api-inference.modelscope.cn/v1");
        std::env::set_var("LLM_TEMPERATURE", "9.5");
        std::env::set_var("OLLAMA_BASE_URL", "");

        let config = LlmConfig::from_env();
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            config.openai_base_url.as_deref(),
            Some("https://api-inference.modelscope.cn/v1")
        );
        assert_eq!(config.default_temperature, 0.8);
        assert_eq!(config.ollama_base_url, None);

        let manager = config.build_manager().unwrap();
        assert_eq!(manager.model_ids(), vec!["openai:gpt-4o-mini"]);

        for key in [
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
            "LLM_TEMPERATURE",
            "OLLAMA_BASE_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[tokio::test]
    async fn test_model_routing() {
        let manager = LlmManager::new(vec![
            Box::new(ScriptedProvider::new("openai", "gpt-4o-mini", &["from openai"])),
            Box::new(ScriptedProvider::new("ollama", "llama3.2", &["from ", "ollama"])),
        ]);
        let request = GenerateRequest::new(vec![ChatTurn::user("hi")], Duration::from_secs(1));

        let response = manager
            .generate_from_model("ollama:qwen2.5", request.clone())
            .await
            .unwrap();
        assert_eq!(response.text, "from ollama");
        assert_eq!(response.metadata.model, "qwen2.5");

        let chunks: Vec<String> = manager
            .stream_from_model("ollama:llama3.2", request.clone())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["from ", "ollama"]);

        assert!(matches!(
            manager.generate_from_model("nope", request.clone()).await,
            Err(LlmError::ConfigError(_))
        ));
        assert!(matches!(
            manager.generate_from_model("anthropic:x", request).await,
            Err(LlmError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_from_all_skips_failures() {
        let manager = LlmManager::new(vec![
            Box::new(ScriptedProvider::new("openai", "a", &["ok"])),
            Box::new(ScriptedProvider::new("ollama", "b", &["x"]).failing()),
        ]);
        let results = manager
            .generate_from_all(GenerateRequest::new(
                vec![ChatTurn::user("hi")],
                Duration::from_secs(1),
            ))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "openai:a");
    }
}
