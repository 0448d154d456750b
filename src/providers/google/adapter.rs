use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use crate::models::{ProviderId, Role};
use crate::providers::traits::AiProvider;
use crate::providers::types::*;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    client: Client,
}

impl GoogleProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn base_url(custom: Option<&str>) -> &str {
        custom.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<GeminiErrorResponse>(body) {
            if let Some(msg) = parsed.error.message {
                return format!("HTTP {}: {}", status.as_u16(), msg);
            }
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn build_request(request: &ChatRequest) -> GeminiRequest {
        let mut system_parts: Vec<GeminiPart> = request
            .system_prompt
            .iter()
            .filter(|p| !p.is_empty())
            .map(GeminiPart::text)
            .collect();
        let mut contents = Vec::new();

        for msg in &request.messages {
            let role = match msg.role {
                Role::System => {
                    if !msg.content.is_empty() {
                        system_parts.push(GeminiPart::text(msg.content.clone()));
                    }
                    continue;
                }
                Role::User => "user",
                Role::Assistant => "model",
            };

            // Images first, then text
            let mut parts: Vec<GeminiPart> = msg
                .images
                .iter()
                .map(|img| GeminiPart {
                    text: None,
                    inline_data: Some(GeminiInlineData {
                        mime_type: img.mime_type.clone(),
                        data: base64::engine::general_purpose::STANDARD.encode(&img.data),
                    }),
                })
                .collect();
            if !msg.content.is_empty() || parts.is_empty() {
                parts.push(GeminiPart::text(msg.content.clone()));
            }

            contents.push(GeminiContent {
                role: role.to_string(),
                parts,
            });
        }

        let system_instruction = (!system_parts.is_empty()).then(|| GeminiContent {
            role: "user".to_string(),
            parts: system_parts,
        });

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then(|| GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }

    async fn post(&self, url: &str, request: &ChatRequest) -> Result<reqwest::Response, ProviderError> {
        let body = Self::build_request(request);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &request.api_key)
            .json(&body)
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

        // An invalid key comes back as 400 INVALID_ARGUMENT.
        if text.contains("API_KEY_INVALID") || text.contains("API key not valid") {
            return Err(ProviderError::AuthError(message));
        }
        Err(ProviderError::from_status(status, retry_after.as_ref(), message))
    }
}

#[async_trait]
impl AiProvider for GoogleProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Google
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent",
            Self::base_url(request.base_url.as_deref()),
            request.model
        );

        let response = self.post(&url, &request).await?;

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if let Some(error) = &gemini_response.error {
            return Err(ProviderError::RequestFailed(
                error.message.clone().unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let content = gemini_response
            .text()
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))?;

        let (tokens_in, tokens_out) = gemini_response
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
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

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            Self::base_url(request.base_url.as_deref()),
            request.model
        );

        let response = self.post(&url, &request).await?;

        parse_sse_stream(response.bytes_stream(), tx).await;

        Ok(())
    }
}
