use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

use super::models::*;
use crate::models::{ProviderId, Role};
use crate::providers::traits::AiProvider;
use crate::providers::types::*;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const IMAGE_MODEL: &str = "dall-e-3";
const IMAGE_SIZE: &str = "1024x1024";

pub struct OpenAiProvider {
    client: Client,
}

impl OpenAiProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn base_url(custom: Option<&str>) -> &str {
        custom.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn build_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        let mut result = Vec::new();

        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            result.push(OpenAiMessage {
                role: "system".to_string(),
                content: OpenAiContent::Text(prompt.to_string()),
            });
        }

        for msg in messages {
            let content = if msg.images.is_empty() {
                OpenAiContent::Text(msg.content.clone())
            } else {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(OpenAiContentPart::Text {
                        text: msg.content.clone(),
                    });
                }
                parts.extend(msg.images.iter().map(|img| OpenAiContentPart::ImageUrl {
                    image_url: OpenAiImageUrl {
                        url: img.to_data_uri(),
                    },
                }));
                OpenAiContent::Parts(parts)
            };

            result.push(OpenAiMessage {
                role: msg.role.as_str().to_string(),
                content,
            });
        }

        result
    }

    fn build_request(request: &ChatRequest, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request.system_prompt.as_deref(), &request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn post<T: Serialize>(
        &self,
        url: &str,
        api_key: &str,
        body: &T,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response.headers().get("retry-after").cloned();
        let text = response.text().await.unwrap_or_default();
        let message = Self::parse_error_message(status, &text);

        if text.contains("invalid_api_key") {
            return Err(ProviderError::AuthError(message));
        }
        Err(ProviderError::from_status(status, retry_after.as_ref(), message))
    }

    /// Generate one image for `prompt` and return its decoded bytes (PNG).
    pub async fn generate_image(
        &self,
        api_key: &str,
        base_url: Option<&str>,
        prompt: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/images/generations", Self::base_url(base_url));
        let body = OpenAiImageRequest {
            model: IMAGE_MODEL.to_string(),
            prompt: prompt.to_string(),
            n: 1,
            size: IMAGE_SIZE.to_string(),
            response_format: "b64_json".to_string(),
        };

        let response = self.post(&url, api_key, &body).await?;
        let parsed: OpenAiImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let encoded = parsed
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| ProviderError::InvalidResponse("No image in response".to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProviderError::InvalidResponse(format!("Bad image payload: {}", e)))
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", Self::base_url(request.base_url.as_deref()));
        let body = Self::build_request(&request, false);

        let response = self.post(&url, &request.api_key, &body).await?;

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))?;

        let (tokens_in, tokens_out) = openai_response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            model: request.model,
            tokens_in,
            tokens_out,
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use super::stream::parse_sse_stream;

        let url = format!("{}/chat/completions", Self::base_url(request.base_url.as_deref()));
        let body = Self::build_request(&request, true);

        let response = self.post(&url, &request.api_key, &body).await?;

        parse_sse_stream(response.bytes_stream(), tx).await;

        Ok(())
    }
}
