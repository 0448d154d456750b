use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use crate::models::{ProviderId, Role};
use crate::providers::traits::AiProvider;
use crate::providers::types::*;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
}

impl AnthropicProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn base_url(custom: Option<&str>) -> &str {
        custom.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    /// The Messages API takes system text as a top-level field, so system
    /// turns are folded into it instead of the message list.
    fn build_messages(
        system_prompt: Option<&str>,
        messages: &[ChatMessage],
    ) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_parts: Vec<String> = system_prompt
            .filter(|p| !p.is_empty())
            .map(|p| vec![p.to_string()])
            .unwrap_or_default();
        let mut result = Vec::new();

        for msg in messages {
            let role = match msg.role {
                Role::System => {
                    if !msg.content.is_empty() {
                        system_parts.push(msg.content.clone());
                    }
                    continue;
                }
                Role::User => "user",
                Role::Assistant => "assistant",
            };

            let content = if msg.images.is_empty() {
                AnthropicContent::Text(msg.content.clone())
            } else {
                let mut blocks: Vec<AnthropicContentBlock> = msg
                    .images
                    .iter()
                    .map(|img| AnthropicContentBlock::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: img.mime_type.clone(),
                            data: base64::engine::general_purpose::STANDARD.encode(&img.data),
                        },
                    })
                    .collect();
                if !msg.content.is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                AnthropicContent::Blocks(blocks)
            };

            result.push(AnthropicMessage {
                role: role.to_string(),
                content,
            });
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, result)
    }

    fn build_request(request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let (system, messages) =
            Self::build_messages(request.system_prompt.as_deref(), &request.messages);
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
            stream: stream.then_some(true),
        }
    }

    async fn post(
        &self,
        request: &ChatRequest,
        body: &AnthropicRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/messages", Self::base_url(request.base_url.as_deref()));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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

        // Anthropic reports a bad key as 401, but some proxies answer 400 with
        // an authentication_error body.
        if text.contains("authentication_error") {
            return Err(ProviderError::AuthError(message));
        }
        Err(ProviderError::from_status(status, retry_after.as_ref(), message))
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_request(&request, false);
        let response = self.post(&request, &body).await?;

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = anthropic_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        let (tokens_in, tokens_out) = anthropic_response
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
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

        let body = Self::build_request(&request, true);
        let response = self.post(&request, &body).await?;

        parse_sse_stream(response.bytes_stream(), tx).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(base_url: String) -> ChatRequest {
        ChatRequest {
            api_key: "sk-ant".into(),
            model: "claude-3-haiku-20240307".into(),
            messages: vec![
                ChatMessage::new(Role::System, "Be brief."),
                ChatMessage::new(Role::User, "Hello"),
            ],
            base_url: Some(base_url),
            temperature: None,
            system_prompt: Some("You are a helpful assistant.".into()),
            max_tokens: Some(100),
        }
    }

    #[test]
    fn test_system_turns_fold_into_system_field() {
        let req = request("http://unused".into());
        let (system, messages) =
            AnthropicProvider::build_messages(req.system_prompt.as_deref(), &req.messages);
        assert_eq!(
            system.as_deref(),
            Some("You are a helpful assistant.\n\nBe brief.")
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_images_become_blocks() {
        let mut msg = ChatMessage::new(Role::User, "What is this?");
        msg.images.push(ImageAttachment {
            mime_type: "image/png".into(),
            data: vec![1, 2, 3],
        });
        let (_, messages) = AnthropicProvider::build_messages(None, &[msg]);
        let json = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(json["content"][0]["type"], "image");
        assert_eq!(json["content"][0]["source"]["data"], "AQID");
        assert_eq!(json["content"][1]["text"], "What is this?");
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-ant"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "Hi there"}],
                "usage": {"input_tokens": 5, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(Client::new());
        let response = provider.send_message(request(server.uri())).await.unwrap();
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.tokens_out, Some(2));
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(Client::new());
        let (tx, _rx) = mpsc::channel(8);
        let err = provider
            .stream_message(request(server.uri()), tx)
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }
}
