//! Provider registry and the chat-client trait.
//!
//! Both recognised providers speak the OpenAI-compatible wire format, so a
//! single HTTP client covers them; the registry only varies the base URL,
//! default model and API-key environment variable.

mod openai_compatible;

pub use openai_compatible::OpenAiCompatibleClient;

use std::env;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LlmError, Result};

/// A recognised LLM provider. Unknown names fail fast at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    DeepSeek,
}

impl Provider {
    /// Parse a provider selector. This is the single entry point for the
    /// environment contract: a name plus the matching API-key variable.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "deepseek" => Ok(Provider::DeepSeek),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::DeepSeek => "deepseek",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o",
            Provider::DeepSeek => "deepseek-chat",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Read the provider's API key from the environment, failing fast when it
    /// is absent.
    pub fn api_key(&self) -> Result<String> {
        match env::var(self.api_key_env()) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(LlmError::MissingApiKey(self.api_key_env())),
        }
    }

    /// Build the HTTP client for this provider, with an optional model
    /// override.
    pub fn client(&self, model: Option<&str>) -> Result<Arc<dyn LlmChatClient>> {
        let key = self.api_key()?;
        let model = model.unwrap_or_else(|| self.default_model());
        Ok(Arc::new(OpenAiCompatibleClient::new(
            self.name(),
            Some(key),
            self.base_url(),
            model,
        )))
    }
}

/// A single chat-completion exchange.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Provider name that produced the completion.
    pub provider: String,
    /// Raw assistant text.
    pub content: String,
    /// Total token count reported by the provider, 0 if absent.
    pub total_tokens: u32,
}

/// Object-safe transport seam. The pipeline only ever talks to this trait, so
/// tests can substitute scripted responses.
#[async_trait]
pub trait LlmChatClient: Send + Sync + std::fmt::Debug {
    /// Send one system+user exchange and return the completion.
    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: Option<u32>,
        json_mode: bool,
    ) -> Result<ChatCompletion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers_parse() {
        assert_eq!(Provider::from_name("openai").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::from_name("DeepSeek").unwrap(), Provider::DeepSeek);
        assert_eq!(Provider::from_name(" openai ").unwrap(), Provider::OpenAi);
    }

    #[test]
    fn test_unknown_provider_fails_fast() {
        let err = Provider::from_name("mistral").unwrap_err();
        assert!(matches!(err, LlmError::UnknownProvider(_)));
    }

    #[test]
    fn test_provider_defaults() {
        assert_eq!(Provider::DeepSeek.default_model(), "deepseek-chat");
        assert_eq!(Provider::DeepSeek.api_key_env(), "DEEPSEEK_API_KEY");
        assert!(Provider::OpenAi.base_url().starts_with("https://"));
    }
}
