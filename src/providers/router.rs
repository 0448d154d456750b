use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use super::registry::{self, ModelConfig};
use super::traits::AiProvider;
use super::types::{ChatMessage, ChatRequest, ChatResponse, ProviderError, StreamEvent};
use super::anthropic::AnthropicProvider;
use super::google::GoogleProvider;
use super::openai::OpenAiProvider;
use crate::config::{AppConfig, ProviderCredentials};
use crate::models::ProviderId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid model selected: {0}")]
    UnknownModel(String),

    #[error("Invalid provider configuration: {} is not configured", .0.display_name())]
    ProviderNotConfigured(ProviderId),
}

struct Binding {
    provider: Arc<dyn AiProvider>,
    credentials: ProviderCredentials,
}

/// Maps providers to adapters plus the credentials they run with.
pub struct ProviderRouter {
    providers: HashMap<ProviderId, Binding>,
}

/// A model resolved against the registry and bound to a live adapter.
#[derive(Clone)]
pub struct ProviderHandle {
    pub model: &'static ModelConfig,
    provider: Arc<dyn AiProvider>,
    api_key: String,
    base_url: Option<String>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register an adapter for every provider with a key in `config`.
    pub fn from_config(config: &AppConfig, client: reqwest::Client) -> Self {
        let mut router = Self::new();
        for provider_id in [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Google] {
            let Some(credentials) = config.credentials(provider_id) else {
                tracing::warn!(provider = provider_id.as_str(), "no API key, provider disabled");
                continue;
            };
            let provider: Arc<dyn AiProvider> = match provider_id {
                ProviderId::OpenAi => Arc::new(OpenAiProvider::new(client.clone())),
                ProviderId::Anthropic => Arc::new(AnthropicProvider::new(client.clone())),
                ProviderId::Google => Arc::new(GoogleProvider::new(client.clone())),
            };
            router.register(provider, credentials.clone());
        }
        router
    }

    pub fn register(&mut self, provider: Arc<dyn AiProvider>, credentials: ProviderCredentials) {
        tracing::info!(provider = provider.provider_id().as_str(), "registered provider");
        self.providers.insert(
            provider.provider_id(),
            Binding {
                provider,
                credentials,
            },
        );
    }

    pub fn is_configured(&self, provider_id: ProviderId) -> bool {
        self.providers.contains_key(&provider_id)
    }

    pub fn resolve(&self, model_id: &str) -> Result<ProviderHandle, RouteError> {
        let model = registry::find_model(model_id)
            .ok_or_else(|| RouteError::UnknownModel(model_id.to_string()))?;
        self.bind(model)
    }

    pub fn bind(&self, model: &'static ModelConfig) -> Result<ProviderHandle, RouteError> {
        let binding = self
            .providers
            .get(&model.provider)
            .ok_or(RouteError::ProviderNotConfigured(model.provider))?;
        Ok(ProviderHandle {
            model,
            provider: binding.provider.clone(),
            api_key: binding.credentials.api_key.clone(),
            base_url: binding.credentials.base_url.clone(),
        })
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHandle {
    pub fn provider_id(&self) -> ProviderId {
        self.model.provider
    }

    pub fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> ChatRequest {
        ChatRequest {
            api_key: self.api_key.clone(),
            model: self.model.api_identifier.to_string(),
            messages,
            base_url: self.base_url.clone(),
            temperature,
            system_prompt,
            max_tokens,
        }
    }

    pub async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.provider.send_message(request).await
    }

    pub async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.provider.stream_message(request, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProvider;

    fn creds() -> ProviderCredentials {
        ProviderCredentials {
            api_key: "key".into(),
            base_url: None,
        }
    }

    #[test]
    fn test_unknown_model() {
        let router = ProviderRouter::new();
        let err = router.resolve("not-a-model").err().unwrap();
        assert_eq!(err, RouteError::UnknownModel("not-a-model".into()));
    }

    #[test]
    fn test_unconfigured_provider() {
        let mut router = ProviderRouter::new();
        router.register(Arc::new(ScriptedProvider::tokens(ProviderId::OpenAi, &["hi"])), creds());

        assert!(router.resolve("gpt-4o-mini").is_ok());
        let err = router.resolve("claude-3-haiku-20240307").err().unwrap();
        assert_eq!(err, RouteError::ProviderNotConfigured(ProviderId::Anthropic));
    }

    #[test]
    fn test_from_config_registers_keyed_providers() {
        let config = AppConfig::from_lookup(|key| match key {
            "AUTH_JWT_SECRET" => Some("s".into()),
            "DATABASE_PATH" => Some("/tmp/x.db".into()),
            "ANTHROPIC_API_KEY" => Some("sk-ant".into()),
            _ => None,
        })
        .unwrap();
        let router = ProviderRouter::from_config(&config, reqwest::Client::new());
        assert!(router.is_configured(ProviderId::Anthropic));
        assert!(!router.is_configured(ProviderId::OpenAi));
        assert!(!router.is_configured(ProviderId::Google));
    }

    #[test]
    fn test_request_uses_provider_identifier() {
        let mut router = ProviderRouter::new();
        router.register(Arc::new(ScriptedProvider::tokens(ProviderId::Google, &["hi"])), creds());

        let handle = router.resolve("gemini-2.0-flash-exp").unwrap();
        assert_eq!(handle.provider_id(), ProviderId::Google);
        let request = handle.build_request(Vec::new(), None, Some(64), None);
        assert_eq!(request.model, "gemini-2.0-flash-exp");
        assert_eq!(request.api_key, "key");
        assert_eq!(request.max_tokens, Some(64));
    }
}
